//! Provides the size constrained LRU cache backing each cache group.
//!
//! Every cache group owns one [LRUCache](LRUCache) which keeps the values the local process is
//! responsible for. The cache tracks the bytes allocated by its keys and values and drops the
//! least recently used entries once a configurable budget is exceeded - hence the name LRU cache.
//! Recency is purely defined by access: both a successful lookup and an insert move the affected
//! entry to the most recently used position.
//!
//! The cache itself is a plain data structure without any synchronization - its owner decides
//! how to guard it (a cache group simply wraps it in a mutex). This keeps the bookkeeping simple
//! and testable while still permitting highly concurrent use one level up.
mod lru_cache;

pub use lru_cache::ByteSize;
pub use lru_cache::LRUCache;
