//! Shared test utilities
//!
//! - `TestRedis`: throwaway Redis container (feature: "redis")
//! - `TestDataBuilder`: deterministic recipients and key prefixes
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn stores_jobs() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("stores_jobs");
//!     let store = RedisStore::<EmailJob>::new(redis.connection_manager().await, &builder.key_prefix(), "emails");
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Seeded generator so a test produces the same data on every run while
/// different tests never collide.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed derived from the test name. Preferred constructor.
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// A syntactically valid, test-unique recipient address.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.email("alice"), "alice+7@example.test");
    /// ```
    pub fn email(&self, local: &str) -> String {
        format!("{}+{}@example.test", local, self.seed)
    }

    /// Redis key namespace isolating one test's data.
    pub fn key_prefix(&self) -> String {
        format!("test:{}", self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_deterministic() {
        let a = TestDataBuilder::from_test_name("same");
        let b = TestDataBuilder::from_test_name("same");
        assert_eq!(a.email("x"), b.email("x"));
        assert_eq!(a.key_prefix(), b.key_prefix());
    }

    #[test]
    fn different_tests_get_different_data() {
        let a = TestDataBuilder::from_test_name("one");
        let b = TestDataBuilder::from_test_name("two");
        assert_ne!(a.key_prefix(), b.key_prefix());
        assert_ne!(a.email("x"), b.email("x"));
    }
}
