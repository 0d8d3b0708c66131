//! Work scheduling: the tagged mutation queue and the debounced save timer.

pub mod debounce;
pub mod task_queue;
