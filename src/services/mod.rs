pub mod meals;
pub mod memory_queue;
pub mod queue;
pub mod vision;
