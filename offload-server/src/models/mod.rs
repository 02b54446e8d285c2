pub mod option;
pub mod scheduled_event;
