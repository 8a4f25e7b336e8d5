pub mod list;
pub mod logs;
pub mod run;
pub mod test_run;
