pub mod command;
pub mod fs;
pub mod logging;
