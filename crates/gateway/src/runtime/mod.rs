pub mod bus;
pub mod connections;
pub mod history;
pub mod worker;
