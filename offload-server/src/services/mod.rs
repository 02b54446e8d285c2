pub mod event_dispatcher;
pub mod event_logger;
pub mod operator;
pub mod purge_scheduler;
