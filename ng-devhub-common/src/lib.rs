pub mod bus;
pub mod logger;
pub mod population;
pub mod scheduler;
