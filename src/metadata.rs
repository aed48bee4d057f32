//! Metadata extraction — picks allow-listed attributes off a message.

use std::collections::HashMap;

/// Extracts a configured subset of message attributes.
#[derive(Debug, Clone, Default)]
pub struct MetadataExtractor {
    /// Allow-listed keys, deduplicated, in configured order.
    metadata_keys: Vec<String>,
}

impl MetadataExtractor {
    /// Create an extractor for the given allow-list. An empty list is valid
    /// and extracts nothing.
    pub fn new<I, S>(metadata_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = Vec::new();
        for key in metadata_keys {
            let key = key.into();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Self {
            metadata_keys: keys,
        }
    }

    /// The allow-list this extractor was built with.
    pub fn keys(&self) -> &[String] {
        &self.metadata_keys
    }

    /// Attributes whose key is both present and allow-listed.
    pub fn extract(&self, metadata: &HashMap<String, String>) -> HashMap<String, String> {
        self.present(metadata)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Render the extracted attributes as `key: value, key: value`.
    ///
    /// Segments follow allow-list order. Empty when nothing matches.
    pub fn extract_string(&self, metadata: &HashMap<String, String>) -> String {
        self.present(metadata)
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn present<'a>(
        &'a self,
        metadata: &'a HashMap<String, String>,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.metadata_keys.iter().filter_map(move |key| {
            metadata
                .get(key)
                .map(|value| (key.as_str(), value.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extract_restricts_to_allow_list() {
        let ex = MetadataExtractor::new(["env", "service"]);
        let msg = attrs(&[("env", "prod"), ("publish_time", "1700000000"), ("team", "infra")]);

        let got = ex.extract(&msg);
        assert_eq!(got, attrs(&[("env", "prod")]));
        assert!(got.keys().all(|k| ex.keys().contains(k)));
    }

    #[test]
    fn empty_allow_list_extracts_nothing() {
        let ex = MetadataExtractor::new(Vec::<String>::new());
        let msg = attrs(&[("env", "prod")]);
        assert!(ex.extract(&msg).is_empty());
        assert_eq!(ex.extract_string(&msg), "");
    }

    #[test]
    fn missing_keys_are_omitted() {
        let ex = MetadataExtractor::new(["env", "region"]);
        let msg = attrs(&[("region", "eu-west1")]);
        assert_eq!(ex.extract_string(&msg), "region: eu-west1");
    }

    #[test]
    fn string_has_one_segment_per_present_key() {
        let ex = MetadataExtractor::new(["env", "service", "region", "env"]);
        let msg = attrs(&[("env", "prod"), ("service", "api"), ("other", "x")]);

        let rendered = ex.extract_string(&msg);
        assert_eq!(rendered, "env: prod, service: api");

        let segments: Vec<&str> = rendered.split(", ").collect();
        assert_eq!(segments.len(), ex.extract(&msg).len());
    }

    #[test]
    fn extract_is_idempotent() {
        let ex = MetadataExtractor::new(["env", "service"]);
        let msg = attrs(&[("env", "prod"), ("service", "api")]);
        assert_eq!(ex.extract(&msg), ex.extract(&msg));
        assert_eq!(ex.extract_string(&msg), ex.extract_string(&msg));
    }

    #[test]
    fn no_matching_keys_gives_empty_string() {
        let ex = MetadataExtractor::new(["env"]);
        assert_eq!(ex.extract_string(&HashMap::new()), "");
    }
}
