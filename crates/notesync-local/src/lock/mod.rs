mod file;

pub use file::{FileLock, LockRecord};
