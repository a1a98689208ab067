use parking_lot::Mutex;
use std::sync::Arc;

/// Exclusive shared state, locked briefly and never across an `.await`.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
