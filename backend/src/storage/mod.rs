pub mod history_store;
pub mod uploads;
