pub mod config;
pub mod model;
pub mod state;

// Operations and cascades
pub mod cascade;
pub mod deps;
pub mod registry;

// Logs, search and exec
pub mod exec;
pub mod full_log;
pub mod logs;
pub mod scan;

// Parsing of docker / compose / git output
pub mod compose;
pub mod stats;
pub mod worktree;

// Input and timing state machines
pub mod input;
pub mod timing;

// Terminal text helpers
pub mod text;
