use crate::error::{LatchTreeError, LatchTreeResult};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;

/// Options used when building a [`crate::Tree`].
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Byte budget of every node, leaf and internal alike.
    pub page_size: usize,
    pub min_cache_bytes: usize,
    /// Soft ceiling on resident node bytes. Crossing it only logs a warning,
    /// nodes are never evicted by this crate.
    pub max_cache_bytes: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            page_size: DEFAULT_PAGE_SIZE,
            min_cache_bytes: 1024 * 1024,
            max_cache_bytes: 16 * 1024 * 1024,
        }
    }
}

impl TreeConfig {
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn min_cache_size(mut self, min_bytes: usize) -> Self {
        self.min_cache_bytes = min_bytes;
        self
    }

    pub fn max_cache_size(mut self, max_bytes: usize) -> Self {
        self.max_cache_bytes = max_bytes;
        self
    }

    pub fn validate(&self) -> LatchTreeResult<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(LatchTreeError::InvalidConfig(format!(
                "page size {} must be a power of two between {} and {}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.min_cache_bytes > self.max_cache_bytes {
            return Err(LatchTreeError::InvalidConfig(format!(
                "min cache size {} exceeds max cache size {}",
                self.min_cache_bytes, self.max_cache_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{TreeConfig, DEFAULT_PAGE_SIZE};
    use crate::error::LatchTreeError;

    #[test]
    fn test_default_config_is_valid() {
        let config = TreeConfig::default();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_setters() {
        let config = TreeConfig::default()
            .page_size(1024)
            .min_cache_size(4096)
            .max_cache_size(8192);
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.min_cache_bytes, 4096);
        assert_eq!(config.max_cache_bytes, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_page_sizes() {
        for size in [0, 100, 3000, 256, 131072] {
            let err = TreeConfig::default().page_size(size).validate().unwrap_err();
            assert!(matches!(err, LatchTreeError::InvalidConfig(_)));
        }
    }

    #[test]
    fn test_cache_bounds_must_be_ordered() {
        let err = TreeConfig::default()
            .min_cache_size(10)
            .max_cache_size(5)
            .validate()
            .unwrap_err();
        assert!(matches!(err, LatchTreeError::InvalidConfig(_)));
    }
}
