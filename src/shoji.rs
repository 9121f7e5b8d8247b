use indexmap::IndexMap;
use serde_json::{Value, json};

/// A `shoji:entity` document: a single resource with its body plus the URLs
/// of its sub-resources (catalogs, fragments, views).
#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct ShojiEntity {
    #[serde(default, rename = "self")]
    pub(crate) self_url: Option<String>,
    #[serde(default)]
    pub(crate) body: Value,
    #[serde(default)]
    pub(crate) catalogs: IndexMap<String, String>,
    #[serde(default)]
    pub(crate) fragments: IndexMap<String, String>,
    #[serde(default)]
    pub(crate) views: IndexMap<String, String>,
}

/// A `shoji:catalog` document: an index of entity URLs to summary tuples.
/// The index preserves server order.
#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct ShojiCatalog {
    #[serde(default)]
    pub(crate) index: IndexMap<String, Value>,
}

/// A `shoji:order` document: a graph of entity URLs and `{name: [...]}`
/// group objects.
#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct ShojiOrder {
    #[serde(default)]
    pub(crate) graph: Vec<Value>,
}

pub(crate) fn entity_wrapper(body: Value) -> Value {
    json!({"element": "shoji:entity", "body": body})
}

pub(crate) fn order_wrapper(graph: Vec<Value>) -> Value {
    json!({"element": "shoji:order", "graph": graph})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_deserializes_with_missing_parts() {
        let doc = r#"{
            "element": "shoji:entity",
            "self": "https://host/api/datasets/abc/",
            "body": {"name": "My survey", "id": "abc"},
            "catalogs": {"variables": "https://host/api/datasets/abc/variables/"}
        }"#;
        let entity: ShojiEntity = serde_json::from_str(doc).unwrap();
        assert_eq!(entity.self_url.as_deref(), Some("https://host/api/datasets/abc/"));
        assert_eq!(entity.body["name"], "My survey");
        assert!(entity.fragments.is_empty());
        assert_eq!(
            entity.catalogs.get("variables").map(String::as_str),
            Some("https://host/api/datasets/abc/variables/")
        );
    }

    #[test]
    fn catalog_index_preserves_order() {
        let doc = r#"{
            "element": "shoji:catalog",
            "index": {
                "https://host/api/x/2/": {"name": "second"},
                "https://host/api/x/1/": {"name": "first"}
            }
        }"#;
        let catalog: ShojiCatalog = serde_json::from_str(doc).unwrap();
        let names: Vec<&str> = catalog
            .index
            .values()
            .map(|v| v["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["second", "first"]);
    }

    #[test]
    fn wrappers_produce_expected_envelopes() {
        let entity = entity_wrapper(json!({"description": "init"}));
        assert_eq!(entity["element"], "shoji:entity");
        assert_eq!(entity["body"]["description"], "init");

        let order = order_wrapper(vec![json!("https://host/api/v/1/")]);
        assert_eq!(order["element"], "shoji:order");
        assert_eq!(order["graph"][0], "https://host/api/v/1/");
    }
}
