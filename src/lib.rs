pub mod browser;
pub mod cli;
pub mod crawler;
pub mod storage;
pub mod utils;
