//! UI Theme Module - Consistent color palette and style helpers
//!
//! Palette tokens instead of hard-coded colors, plus style helpers for the
//! container, health and operation states the dashboard shows.

use ratatui::style::{Color, Modifier, Style};

use recomposable_core::logs::LogAction;
use recomposable_core::model::{ContainerState, HealthStatus};

/// Color palette tokens for the theme
#[derive(Clone, Debug)]
pub struct Palette {
    /// Panel border color
    pub panel_border: Color,
    /// Primary text color
    pub text: Color,
    /// Dimmed text (secondary info)
    pub text_dim: Color,
    /// Muted text (tertiary info, disabled)
    pub text_muted: Color,
    /// Accent color (highlights, focus)
    pub accent: Color,
    /// Success state (running, healthy)
    pub success: Color,
    /// Warning state (starting, restarting, busy)
    pub warn: Color,
    /// Error state (failed, unhealthy)
    pub error: Color,
    /// Info state (ports, uptime)
    pub info: Color,
    /// Selection background
    pub selection_bg: Color,
    /// Selection foreground
    pub selection_fg: Color,
    /// Search match background
    pub match_bg: Color,
    /// Key hint text
    pub key_hint: Color,
}

impl Default for Palette {
    fn default() -> Self {
        Self::dark()
    }
}

impl Palette {
    /// VS Code-esque dark theme
    pub fn dark() -> Self {
        Self {
            panel_border: Color::Rgb(60, 60, 60),
            text: Color::Rgb(212, 212, 212),
            text_dim: Color::Rgb(150, 150, 150),
            text_muted: Color::Rgb(100, 100, 100),
            accent: Color::Rgb(79, 193, 255),      // Light blue
            success: Color::Rgb(78, 201, 176),     // Teal green
            warn: Color::Rgb(220, 180, 100),       // Amber
            error: Color::Rgb(244, 135, 113),      // Coral red
            info: Color::Rgb(156, 220, 254),       // Light cyan
            selection_bg: Color::Rgb(38, 79, 120), // Dark blue
            selection_fg: Color::White,
            match_bg: Color::Rgb(97, 80, 30),
            key_hint: Color::Rgb(206, 145, 120), // Soft orange
        }
    }
}

/// Theme configuration
#[derive(Clone, Debug, Default)]
pub struct Theme {
    pub palette: Palette,
}

impl Theme {
    // ========== StyleKit Helper Functions ==========

    /// Style for a container state
    pub fn state_style(&self, state: Option<&ContainerState>) -> Style {
        let color = match state {
            Some(ContainerState::Running) => self.palette.success,
            Some(ContainerState::Restarting | ContainerState::Created | ContainerState::Removing) => {
                self.palette.warn
            }
            Some(ContainerState::Dead) => self.palette.error,
            Some(ContainerState::Paused) => self.palette.info,
            Some(ContainerState::Exited | ContainerState::Other(_)) | None => self.palette.text_muted,
        };
        Style::default().fg(color)
    }

    /// Icon for a container state; `None` means no container exists
    pub fn state_icon(&self, state: Option<&ContainerState>) -> &'static str {
        match state {
            Some(ContainerState::Running) => "●",
            Some(ContainerState::Restarting) => "⟲",
            Some(ContainerState::Created | ContainerState::Removing) => "◐",
            Some(ContainerState::Paused) => "‖",
            Some(ContainerState::Dead) => "✗",
            Some(ContainerState::Exited | ContainerState::Other(_)) => "○",
            None => "·",
        }
    }

    /// Style for health status
    pub fn health_style(&self, health: &HealthStatus) -> Style {
        let color = match health {
            HealthStatus::Healthy => self.palette.success,
            HealthStatus::Starting => self.palette.warn,
            HealthStatus::Unhealthy => self.palette.error,
        };
        Style::default().fg(color)
    }

    /// Icon for health status
    pub fn health_icon(&self, health: &HealthStatus) -> &'static str {
        match health {
            HealthStatus::Healthy => "✓",
            HealthStatus::Starting => "~",
            HealthStatus::Unhealthy => "!",
        }
    }

    /// Style for the bottom panel tag
    pub fn action_style(&self, action: LogAction) -> Style {
        let color = if action.is_failure() {
            self.palette.error
        } else if action.is_in_progress() {
            self.palette.warn
        } else if action == LogAction::Started {
            self.palette.success
        } else {
            self.palette.text_dim
        };
        Style::default().fg(color).add_modifier(Modifier::BOLD)
    }

    /// Style for key hints in footer
    pub fn key_hint_style(&self) -> Style {
        Style::default().fg(self.palette.key_hint)
    }

    /// Style for subtle borders
    pub fn subtle_border_style(&self) -> Style {
        Style::default().fg(self.palette.panel_border)
    }

    /// Style for focused borders
    pub fn focused_border_style(&self) -> Style {
        Style::default().fg(self.palette.accent)
    }

    /// Style for selected items
    pub fn selection_style(&self) -> Style {
        Style::default()
            .bg(self.palette.selection_bg)
            .fg(self.palette.selection_fg)
            .add_modifier(Modifier::BOLD)
    }

    /// Style for a line matching the active search
    pub fn match_style(&self, current: bool) -> Style {
        let style = Style::default().bg(self.palette.match_bg).fg(self.palette.text);
        if current {
            style.add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
        } else {
            style
        }
    }

    pub fn text_style(&self) -> Style {
        Style::default().fg(self.palette.text)
    }

    pub fn text_dim_style(&self) -> Style {
        Style::default().fg(self.palette.text_dim)
    }

    pub fn text_muted_style(&self) -> Style {
        Style::default().fg(self.palette.text_muted)
    }

    pub fn accent_bold_style(&self) -> Style {
        Style::default()
            .fg(self.palette.accent)
            .add_modifier(Modifier::BOLD)
    }

    pub fn success_style(&self) -> Style {
        Style::default().fg(self.palette.success)
    }

    pub fn warn_style(&self) -> Style {
        Style::default().fg(self.palette.warn)
    }

    pub fn error_style(&self) -> Style {
        Style::default().fg(self.palette.error)
    }

    pub fn info_style(&self) -> Style {
        Style::default().fg(self.palette.info)
    }

    /// Style for section headers (manifest groups)
    pub fn section_header_style(&self) -> Style {
        Style::default()
            .fg(self.palette.accent)
            .add_modifier(Modifier::BOLD)
    }
}

/// Global theme instance
static DEFAULT_THEME: std::sync::OnceLock<Theme> = std::sync::OnceLock::new();

/// Get the default theme
pub fn theme() -> &'static Theme {
    DEFAULT_THEME.get_or_init(Theme::default)
}

/// Convenience re-exports for common use cases
pub mod styles {
    use super::*;

    pub fn state(state: Option<&ContainerState>) -> Style {
        theme().state_style(state)
    }

    pub fn state_icon(state: Option<&ContainerState>) -> &'static str {
        theme().state_icon(state)
    }

    pub fn health(health: &HealthStatus) -> Style {
        theme().health_style(health)
    }

    pub fn health_icon(health: &HealthStatus) -> &'static str {
        theme().health_icon(health)
    }

    pub fn action(action: LogAction) -> Style {
        theme().action_style(action)
    }

    pub fn key_hint() -> Style {
        theme().key_hint_style()
    }

    pub fn border_subtle() -> Style {
        theme().subtle_border_style()
    }

    pub fn border_focused() -> Style {
        theme().focused_border_style()
    }

    pub fn selection() -> Style {
        theme().selection_style()
    }

    pub fn search_match(current: bool) -> Style {
        theme().match_style(current)
    }

    pub fn text() -> Style {
        theme().text_style()
    }

    pub fn text_dim() -> Style {
        theme().text_dim_style()
    }

    pub fn text_muted() -> Style {
        theme().text_muted_style()
    }

    pub fn accent_bold() -> Style {
        theme().accent_bold_style()
    }

    pub fn success() -> Style {
        theme().success_style()
    }

    pub fn warn() -> Style {
        theme().warn_style()
    }

    pub fn error() -> Style {
        theme().error_style()
    }

    pub fn info() -> Style {
        theme().info_style()
    }

    pub fn section_header() -> Style {
        theme().section_header_style()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tags_render_as_errors() {
        let t = Theme::default();
        assert_eq!(t.action_style(LogAction::BuildFailed).fg, Some(t.palette.error));
        assert_eq!(t.action_style(LogAction::Rebuilding).fg, Some(t.palette.warn));
        assert_eq!(t.action_style(LogAction::Started).fg, Some(t.palette.success));
    }

    #[test]
    fn test_missing_container_icon() {
        let t = Theme::default();
        assert_eq!(t.state_icon(None), "·");
        assert_eq!(t.state_icon(Some(&ContainerState::Running)), "●");
    }
}
