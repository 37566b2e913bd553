pub mod backup;
pub mod config;
pub mod error;
pub mod health;
pub mod import;
pub mod league_rules;
pub mod pipeline;
pub mod precheck;
pub mod records;
pub mod report;
pub mod score;
pub mod store;
pub mod winner;
