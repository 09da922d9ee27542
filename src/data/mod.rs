pub mod calendar;
pub mod indicator_store;
pub mod price_store;
pub mod provider;
pub mod storage;
