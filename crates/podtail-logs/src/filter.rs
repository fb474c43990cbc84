use regex::RegexSet;

/// Compiled exclude patterns for log lines
#[derive(Clone)]
pub struct LineFilter {
    /// All exclude patterns, matched in a single pass
    exclude: RegexSet,
}

impl LineFilter {
    /// Compile a list of exclude patterns. An empty list excludes nothing.
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            exclude: RegexSet::new(patterns)?,
        })
    }

    /// Check if a line should be dropped
    pub fn excludes(&self, line: &str) -> bool {
        self.exclude.is_match(line)
    }

    /// Get the original patterns
    pub fn patterns(&self) -> &[String] {
        self.exclude.patterns()
    }

    /// Check if filter is empty (keeps everything)
    pub fn is_empty(&self) -> bool {
        self.exclude.is_empty()
    }
}

impl Default for LineFilter {
    fn default() -> Self {
        Self {
            exclude: RegexSet::empty(),
        }
    }
}

impl std::fmt::Debug for LineFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineFilter")
            .field("exclude", &self.patterns())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclude_filter() {
        let filter = LineFilter::new(["healthz", "^DEBUG"]).unwrap();

        assert!(filter.excludes("GET /healthz 200"));
        assert!(filter.excludes("DEBUG cache warm"));
        assert!(!filter.excludes("ERROR DEBUG mode unavailable"));
        assert!(!filter.excludes("GET /api/users 200"));
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let filter = LineFilter::default();
        assert!(filter.is_empty());
        assert!(!filter.excludes("anything"));

        let filter = LineFilter::new(Vec::<String>::new()).unwrap();
        assert!(filter.is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(LineFilter::new(["(unclosed"]).is_err());
    }
}
