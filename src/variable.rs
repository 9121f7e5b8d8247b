use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use serde_json::json;

use crate::client::Client;
use crate::shoji::{ShojiEntity, entity_wrapper};
use crate::util::element_id_from_url;

pub(crate) const CATEGORICAL_TYPES: &[&str] =
    &["categorical", "multiple_response", "categorical_array"];

/// One category of a categorical variable, as stored in the variable body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub numeric_value: Option<f64>,
    #[serde(default)]
    pub missing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct SubReference {
    #[serde(default)]
    pub(crate) alias: String,
    #[serde(default)]
    pub(crate) name: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct VariableBody {
    #[serde(default)]
    pub(crate) id: String,
    pub(crate) alias: String,
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default)]
    pub(crate) notes: String,
    #[serde(default)]
    pub(crate) derived: bool,
    #[serde(default)]
    pub(crate) discarded: bool,
    #[serde(default)]
    pub(crate) categories: Vec<Category>,
    #[serde(default)]
    pub(crate) subvariables: Vec<String>,
    #[serde(default)]
    pub(crate) subreferences: IndexMap<String, SubReference>,
}

/// Mutable attributes of a variable. Unset fields are left untouched.
/// The alias of a derived variable is immutable on the server and rejected
/// before the request is made.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct VariableEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A column of a dataset: a thin proxy over the variable entity. Attribute
/// reads mirror the last-fetched server state; every edit is a PATCH
/// followed by a refetch.
#[derive(Debug, Clone)]
pub struct Variable {
    client: Client,
    url: String,
    body: VariableBody,
}

impl Variable {
    pub(crate) fn fetch(client: &Client, url: &str) -> Result<Self> {
        let entity: ShojiEntity = client.get_json(url)?;
        let url = entity.self_url.clone().unwrap_or_else(|| url.to_string());
        let body: VariableBody = serde_json::from_value(entity.body)
            .with_context(|| format!("unexpected variable body at {}", url))?;
        Ok(Variable {
            client: client.clone(),
            url,
            body,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> &str {
        &self.body.id
    }

    pub fn alias(&self) -> &str {
        &self.body.alias
    }

    pub fn name(&self) -> &str {
        &self.body.name
    }

    /// The server-side type, e.g. `numeric`, `text`, `categorical`,
    /// `multiple_response`, `categorical_array`, `datetime`.
    pub fn var_type(&self) -> &str {
        &self.body.kind
    }

    pub fn description(&self) -> &str {
        &self.body.description
    }

    pub fn notes(&self) -> &str {
        &self.body.notes
    }

    pub fn is_derived(&self) -> bool {
        self.body.derived
    }

    /// Hidden variables stay on the server but are dropped from catalogs
    /// and exports.
    pub fn is_hidden(&self) -> bool {
        self.body.discarded
    }

    pub fn reload(&mut self) -> Result<()> {
        *self = Variable::fetch(&self.client, &self.url)?;
        Ok(())
    }

    pub fn edit(&mut self, edit: &VariableEdit) -> Result<()> {
        if edit.alias.is_some() && self.body.derived {
            bail!(
                "can't edit alias of derived variable {}",
                self.body.alias
            );
        }
        let body = serde_json::to_value(edit)?;
        self.client.patch(&self.url, &entity_wrapper(body))?;
        self.reload()
    }

    pub fn hide(&mut self) -> Result<()> {
        self.client
            .patch(&self.url, &entity_wrapper(json!({"discarded": true})))?;
        self.reload()
    }

    pub fn unhide(&mut self) -> Result<()> {
        self.client
            .patch(&self.url, &entity_wrapper(json!({"discarded": false})))?;
        self.reload()
    }

    pub fn delete(self) -> Result<()> {
        self.client.delete(&self.url)
    }

    /// The categories of a categorical-class variable. Other types have
    /// none and asking for them is an error.
    pub fn categories(&self) -> Result<&[Category]> {
        self.require_categorical()?;
        Ok(&self.body.categories)
    }

    /// Replaces the full category list.
    pub fn edit_categories(&mut self, categories: Vec<Category>) -> Result<()> {
        self.require_categorical()?;
        let mut seen = std::collections::HashSet::new();
        for category in &categories {
            if !seen.insert(category.id) {
                bail!("duplicate category id {}", category.id);
            }
        }
        self.patch_categories(&categories)
    }

    /// Adds one category, at the end or immediately before `before_id`.
    pub fn add_category(&mut self, category: Category, before_id: Option<i64>) -> Result<()> {
        self.require_categorical()?;
        if self.body.derived {
            bail!(
                "can't add categories on derived variable {}",
                self.body.alias
            );
        }
        if self.body.categories.iter().any(|c| c.id == category.id) {
            bail!("category id {} already exists", category.id);
        }

        let mut categories = self.body.categories.clone();
        match before_id {
            Some(before_id) => {
                let at = categories
                    .iter()
                    .position(|c| c.id == before_id)
                    .with_context(|| format!("no category with id {}", before_id))?;
                categories.insert(at, category);
            }
            None => categories.push(category),
        }
        self.patch_categories(&categories)
    }

    /// Applies a complete reordering of the category list. The id list must
    /// name every category exactly once.
    pub fn reorder_categories(&mut self, ids: &[i64]) -> Result<()> {
        self.require_categorical()?;
        let existing: Vec<i64> = self.body.categories.iter().map(|c| c.id).collect();
        let mut sorted_ids = ids.to_vec();
        sorted_ids.sort_unstable();
        let mut sorted_existing = existing.clone();
        sorted_existing.sort_unstable();
        if sorted_ids != sorted_existing {
            bail!("invalid list of category ids for the reorder operation");
        }
        if existing == ids {
            // Nothing to do.
            return Ok(());
        }

        let mut categories = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(category) = self.body.categories.iter().find(|c| c.id == *id) {
                categories.push(category.clone());
            }
        }
        self.patch_categories(&categories)
    }

    /// Aliases of the subvariables of an array variable, in display order.
    pub fn subvariable_aliases(&self) -> Vec<String> {
        self.subvar_urls_by_alias().keys().cloned().collect()
    }

    /// Applies a complete reordering of an array variable's subvariables.
    pub fn reorder_subvariables(&mut self, aliases: &[&str]) -> Result<()> {
        let by_alias = self.subvar_urls_by_alias();
        let mut seen = std::collections::HashSet::new();
        for alias in aliases {
            if !seen.insert(*alias) {
                bail!("repeated alias in subvariables: {}", alias);
            }
        }
        if aliases.len() != by_alias.len() || aliases.iter().any(|a| !by_alias.contains_key(*a)) {
            bail!(
                "missing subvariables for this variable; existing: {:?}, given: {:?}",
                by_alias.keys().collect::<Vec<_>>(),
                aliases
            );
        }

        let reordered: Vec<&String> = aliases.iter().filter_map(|a| by_alias.get(*a)).collect();
        // Subvariable order is a plain fragment of the entity, not a body
        // attribute.
        self.client
            .patch(&self.url, &json!({"subvariables": reordered}))?;
        self.reload()
    }

    /// Subvariable alias -> entity URL, in display order.
    pub(crate) fn subvar_urls_by_alias(&self) -> IndexMap<String, String> {
        let mut map = IndexMap::new();
        for url in &self.body.subvariables {
            let subref = self.body.subreferences.get(url).or_else(|| {
                // Subreference keys may be relative while the subvariables
                // list is absolute (or vice versa); fall back to id matching.
                let id = element_id_from_url(url)?;
                self.body
                    .subreferences
                    .iter()
                    .find(|(key, _)| element_id_from_url(key) == Some(id))
                    .map(|(_, subref)| subref)
            });
            if let Some(subref) = subref {
                map.insert(subref.alias.clone(), url.clone());
            }
        }
        map
    }

    fn require_categorical(&self) -> Result<()> {
        if !CATEGORICAL_TYPES.contains(&self.body.kind.as_str()) {
            bail!(
                "variables of type {} do not have categories",
                self.body.kind
            );
        }
        Ok(())
    }

    fn patch_categories(&mut self, categories: &[Category]) -> Result<()> {
        let body = json!({"categories": categories});
        self.client.patch(&self.url, &entity_wrapper(body))?;
        self.reload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Credentials;

    fn offline_client() -> Client {
        Client::new(
            Some("https://host.example.com/api".into()),
            Some(Credentials::ApiKey("test-key".into())),
            Some(true),
        )
        .unwrap()
    }

    fn categorical(alias: &str) -> Variable {
        let body = serde_json::json!({
            "id": "0001",
            "alias": alias,
            "name": "Q1",
            "type": "categorical",
            "derived": true,
            "categories": [
                {"id": 1, "name": "Yes", "numeric_value": 1.0, "missing": false},
                {"id": 2, "name": "No", "numeric_value": 2.0, "missing": false},
                {"id": -1, "name": "No Data", "numeric_value": null, "missing": true},
            ],
        });
        Variable {
            client: offline_client(),
            url: "https://host.example.com/api/datasets/d/variables/0001/".into(),
            body: serde_json::from_value(body).unwrap(),
        }
    }

    #[test]
    fn category_round_trip() {
        let raw = r#"{"id": 1, "name": "Yes", "numeric_value": null, "missing": false, "selected": true}"#;
        let category: Category = serde_json::from_str(raw).unwrap();
        assert_eq!(category.selected, Some(true));
        let back = serde_json::to_value(&category).unwrap();
        assert_eq!(back["numeric_value"], serde_json::json!(null));
        // Unset optional attributes stay off the wire.
        let bare = Category {
            id: 2,
            name: "No".into(),
            numeric_value: None,
            missing: false,
            selected: None,
            date: None,
        };
        let back = serde_json::to_value(&bare).unwrap();
        assert!(back.get("selected").is_none());
        assert!(back.get("date").is_none());
    }

    #[test]
    fn non_categorical_variables_have_no_categories() {
        let mut var = categorical("q1");
        var.body.kind = "numeric".into();
        let err = var.categories().unwrap_err();
        assert!(err.to_string().contains("numeric"));
    }

    #[test]
    fn derived_alias_is_immutable() {
        let mut var = categorical("q1");
        let err = var
            .edit(&VariableEdit {
                alias: Some("q1_new".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("derived"));
    }

    #[test]
    fn reorder_categories_rejects_bad_lists() {
        let mut var = categorical("q1");
        for bad in [
            vec![1, 2],            // missing
            vec![1, 2, 2],         // duplicate
            vec![1, 2, -1, 99],    // too many
            vec![1, 2, 99],        // unknown
        ] {
            assert!(var.reorder_categories(&bad).is_err());
        }
        // A no-op reorder never talks to the server.
        var.reorder_categories(&[1, 2, -1]).unwrap();
    }

    #[test]
    fn add_category_rejects_duplicates_and_derived() {
        let mut var = categorical("q1");
        let extra = Category {
            id: 1,
            name: "Again".into(),
            numeric_value: None,
            missing: false,
            selected: None,
            date: None,
        };
        assert!(var.add_category(extra.clone(), None).is_err());

        let fresh = Category { id: 3, ..extra };
        let err = var.add_category(fresh, None).unwrap_err();
        assert!(err.to_string().contains("derived"));
    }

    #[test]
    fn subvariable_alias_resolution_falls_back_to_ids() {
        let body = serde_json::json!({
            "id": "0002",
            "alias": "brands",
            "name": "Brands",
            "type": "multiple_response",
            "subvariables": [
                "https://host/api/datasets/d/variables/0002/subvariables/s1/",
                "https://host/api/datasets/d/variables/0002/subvariables/s2/",
            ],
            "subreferences": {
                "../0002/subvariables/s1/": {"alias": "brands_1", "name": "Coke"},
                "../0002/subvariables/s2/": {"alias": "brands_2", "name": "Pepsi"},
            },
        });
        let var = Variable {
            client: offline_client(),
            url: "https://host/api/datasets/d/variables/0002/".into(),
            body: serde_json::from_value(body).unwrap(),
        };
        assert_eq!(var.subvariable_aliases(), ["brands_1", "brands_2"]);
        let mut clone = var.clone();
        assert!(clone.reorder_subvariables(&["brands_1"]).is_err());
        assert!(clone.reorder_subvariables(&["brands_1", "brands_1"]).is_err());
    }
}
