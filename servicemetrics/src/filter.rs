/// The allow-list that decides which auto-logged requests become samples.
///
/// A request is recorded only when both its method and its api are listed, compared
/// exactly. An empty list allows nothing, so raw paths never reach the `api` label
/// unless they were named up front.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    apis: Vec<String>,
    methods: Vec<String>,
}

impl LogFilter {
    /// Create a filter from api and method allow-lists
    pub fn new(
        apis: impl IntoIterator<Item = impl Into<String>>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            apis: apis.into_iter().map(Into::into).collect(),
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a request to `api` with `method` should be recorded.
    #[inline]
    pub fn allows(&self, api: &str, method: &str) -> bool {
        self.methods.iter().any(|allowed| allowed == method)
            && self.apis.iter().any(|allowed| allowed == api)
    }
}

#[cfg(test)]
mod test {
    use super::LogFilter;

    #[test_log::test]
    fn empty_filter_allows_nothing() {
        let filter = LogFilter::default();
        assert!(!filter.allows("/user/12345", "GET"));
        assert!(!filter.allows("", ""));
    }

    #[test_log::test]
    fn empty_method_list_allows_nothing() {
        let filter = LogFilter::new(["/test"], Vec::<String>::new());
        assert!(!filter.allows("/test", "GET"));

        let filter = LogFilter::new(Vec::<String>::new(), ["GET"]);
        assert!(!filter.allows("/test", "GET"));
    }

    #[test_log::test]
    fn both_lists_must_match() {
        let filter = LogFilter::new(["/foo", "/bar"], ["GET", "POST"]);
        assert!(filter.allows("/foo", "GET"));
        assert!(filter.allows("/bar", "POST"));
        assert!(!filter.allows("/baz", "GET"));
        assert!(!filter.allows("/foo", "PUT"));
        assert!(!filter.allows("/baz", "PUT"));
    }

    #[test_log::test]
    fn matching_is_exact() {
        let filter = LogFilter::new(["/foo"], ["GET"]);
        assert!(filter.allows("/foo", "GET"));
        assert!(!filter.allows("/foo", "get"));
        assert!(!filter.allows("/foo/", "GET"));
        assert!(!filter.allows("/FOO", "GET"));
    }
}
