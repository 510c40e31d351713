pub mod cli;
pub mod infrastructure;
pub mod messaging;
