use anyhow::{Context, Result, anyhow, bail};
use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

use crate::client::Client;
use crate::expr::{Expr, VariableResolver};
use crate::order::VariableOrder;
use crate::recode::{
    CaseRule, CategoryCombination, ResponseCombination, combinations_payload,
    combine_categories_expr, combine_responses_expr, multiple_case_payload, responses_payload,
    single_case_payload,
};
use crate::shoji::{ShojiCatalog, ShojiEntity, entity_wrapper};
use crate::util::{element_id_from_url, subresource};
use crate::variable::Variable;

impl Client {
    /// Fetches a dataset by name or, failing that, by id.
    pub fn dataset(&self, reference: &str) -> Result<Dataset> {
        let catalog: ShojiCatalog = self.get_json(&self.site_catalog("datasets"))?;

        let by_name = catalog.index.iter().find(|(_, tuple)| {
            tuple.get("name").and_then(Value::as_str) == Some(reference)
        });
        let found = by_name.or_else(|| {
            catalog.index.iter().find(|(url, tuple)| {
                tuple.get("id").and_then(Value::as_str) == Some(reference)
                    || element_id_from_url(url) == Some(reference)
            })
        });

        let url = found
            .map(|(url, _)| url.clone())
            .ok_or_else(|| anyhow!("no dataset found with name or id '{}'", reference))?;
        Dataset::fetch(self, &url)
    }

    /// Creates a dataset, optionally with a `crunch:table` metadata
    /// definition of its variables.
    pub fn create_dataset(&self, name: &str, metadata: Option<&Value>) -> Result<Dataset> {
        let mut body = json!({"name": name});
        if let Some(metadata) = metadata {
            body["table"] = json!({"element": "crunch:table", "metadata": metadata});
        }
        let location = self
            .post_tracked(&self.site_catalog("datasets"), &entity_wrapper(body))?
            .ok_or_else(|| anyhow!("dataset creation returned no Location"))?;
        Dataset::fetch(self, &location)
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub(crate) struct DatasetBody {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default)]
    pub(crate) notes: String,
    #[serde(default)]
    pub(crate) owner: Value,
    #[serde(default)]
    pub(crate) streaming: Option<String>,
}

/// Mutable attributes of a dataset. Unset fields are left untouched.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DatasetEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct VariableDef {
    #[serde(default)]
    pub id: String,
    pub alias: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub derived: bool,
    #[serde(default)]
    pub discarded: bool,
}

/// The variables of a dataset, as summarized by the server's variable
/// catalog. Lookups resolve a reference by alias, then name, then id.
#[derive(Debug, Clone)]
pub struct VariableCatalog {
    index: IndexMap<String, VariableDef>,
}

impl VariableCatalog {
    pub(crate) fn from_catalog(catalog: ShojiCatalog) -> Self {
        let index = catalog
            .index
            .into_iter()
            .filter_map(|(url, tuple)| {
                let def: VariableDef = serde_json::from_value(tuple).ok()?;
                Some((url, def))
            })
            .collect();
        VariableCatalog { index }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Aliases in catalog order.
    pub fn aliases(&self) -> Vec<&str> {
        self.index.values().map(|def| def.alias.as_str()).collect()
    }

    /// Resolves a reference to `(entity url, summary)` by alias, then name,
    /// then id.
    pub fn find(&self, reference: &str) -> Option<(&str, &VariableDef)> {
        self.entry_where(|def| def.alias == reference)
            .or_else(|| self.entry_where(|def| def.name == reference))
            .or_else(|| self.entry_where(|def| def.id == reference))
    }

    fn entry_where(&self, pred: impl Fn(&VariableDef) -> bool) -> Option<(&str, &VariableDef)> {
        self.index
            .iter()
            .find(|(_, def)| pred(def))
            .map(|(url, def)| (url.as_str(), def))
    }
}

impl VariableResolver for VariableCatalog {
    fn variable_url(&self, alias: &str) -> Option<String> {
        self.index
            .iter()
            .find(|(_, def)| def.alias == alias)
            .map(|(url, _)| url.clone())
    }
}

/// Fork creation settings.
#[derive(Debug, Clone)]
pub struct ForkOptions {
    /// Name of the fork; defaults to `FORK #<n> of <parent name>`.
    pub name: Option<String>,
    /// Defaults to the parent's description.
    pub description: Option<String>,
    /// Published forks are visible to viewers of the parent dataset.
    pub is_published: bool,
    /// Keep the parent's owner instead of the current user.
    pub preserve_owner: bool,
}

impl Default for ForkOptions {
    fn default() -> Self {
        ForkOptions {
            name: None,
            description: None,
            is_published: false,
            preserve_owner: true,
        }
    }
}

/// A left join against another dataset, matched on a key variable.
#[derive(Debug, Clone)]
pub struct JoinSpec<'a> {
    /// Key variable in this dataset.
    pub left_on: &'a str,
    /// Dataset to bring variables in from.
    pub right: &'a Dataset,
    /// Key variable in the right dataset.
    pub right_on: &'a str,
    /// Subset of right-dataset variables to join; everything when unset.
    pub columns: Option<Vec<&'a str>>,
    /// Row filter evaluated against the right dataset.
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Csv,
    Spss,
}

impl ExportFormat {
    fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Spss => "spss",
        }
    }
}

/// Export settings. The per-format defaults mirror the web application:
/// CSV exports write category ids, SPSS exports label variables by
/// description.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Row filter; unfiltered when unset.
    pub filter: Option<Expr>,
    /// Subset of variables to export; all non-hidden variables when unset.
    pub variables: Option<Vec<String>>,
    /// Extra per-format export options, merged over the defaults.
    pub options: Option<Map<String, Value>>,
}

const VALID_EXPORT_OPTIONS: &[&str] = &[
    "use_category_ids",
    "prefix_subvariables",
    "var_label_field",
    "missing_values",
];

fn export_body_options(format: ExportFormat, extra: Option<&Map<String, Value>>) -> Result<Value> {
    let mut options = match format {
        ExportFormat::Csv => json!({"use_category_ids": true}),
        ExportFormat::Spss => json!({
            "prefix_subvariables": false,
            "var_label_field": "description",
        }),
    };

    if let Some(extra) = extra {
        for (key, value) in extra {
            if !VALID_EXPORT_OPTIONS.contains(&key.as_str()) {
                bail!("invalid export option '{}'", key);
            }
            if key == "var_label_field"
                && !matches!(value.as_str(), Some("name") | Some("description"))
            {
                bail!("the 'var_label_field' export option must be either 'name' or 'description'");
            }
            options[key] = value.clone();
        }
    }
    Ok(options)
}

/// A dataset: a thin proxy over the remote entity. Owns the URLs of its
/// sub-resources and hands out [`Variable`] and [`VariableOrder`] wrappers.
#[derive(Debug, Clone)]
pub struct Dataset {
    client: Client,
    url: String,
    body: DatasetBody,
    catalogs: IndexMap<String, String>,
    fragments: IndexMap<String, String>,
    views: IndexMap<String, String>,
}

impl Dataset {
    pub(crate) fn fetch(client: &Client, url: &str) -> Result<Self> {
        let entity: ShojiEntity = client.get_json(url)?;
        let url = entity.self_url.clone().unwrap_or_else(|| url.to_string());
        let body: DatasetBody = serde_json::from_value(entity.body)
            .with_context(|| format!("unexpected dataset body at {}", url))?;
        Ok(Dataset {
            client: client.clone(),
            url,
            body,
            catalogs: entity.catalogs,
            fragments: entity.fragments,
            views: entity.views,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> &str {
        &self.body.id
    }

    pub fn name(&self) -> &str {
        &self.body.name
    }

    pub fn description(&self) -> &str {
        &self.body.description
    }

    pub fn notes(&self) -> &str {
        &self.body.notes
    }

    pub fn is_streaming(&self) -> bool {
        self.body.streaming.as_deref() == Some("streaming")
    }

    pub fn reload(&mut self) -> Result<()> {
        *self = Dataset::fetch(&self.client, &self.url)?;
        Ok(())
    }

    /// URL of a sub-resource, from the entity's catalogs/fragments/views
    /// with a conventional fallback.
    fn resource_url(&self, name: &str) -> String {
        self.catalogs
            .get(name)
            .or_else(|| self.fragments.get(name))
            .or_else(|| self.views.get(name))
            .cloned()
            .unwrap_or_else(|| subresource(&self.url, name))
    }

    pub fn edit(&mut self, edit: &DatasetEdit) -> Result<()> {
        let body = serde_json::to_value(edit)?;
        self.client.patch(&self.url, &entity_wrapper(body))?;
        self.reload()
    }

    pub fn delete(self) -> Result<()> {
        self.client.delete(&self.url)
    }

    /// The variable catalog: one summary per (non-hidden) variable.
    pub fn variables(&self) -> Result<VariableCatalog> {
        let catalog: ShojiCatalog = self.client.get_json(&self.resource_url("variables"))?;
        Ok(VariableCatalog::from_catalog(catalog))
    }

    /// Fetches a variable by alias, name or id.
    pub fn variable(&self, reference: &str) -> Result<Variable> {
        let catalog = self.variables()?;
        let (url, _) = catalog
            .find(reference)
            .ok_or_else(|| anyhow!("dataset has no variable '{}'", reference))?;
        Variable::fetch(&self.client, url)
    }

    /// Applies (or, with `None`, clears) the exclusion filter. Excluded
    /// rows are dropped from every view and calculation until the filter
    /// is lifted.
    pub fn exclude(&self, expr: Option<&Expr>) -> Result<()> {
        let expression = match expr {
            Some(expr) => expr.to_crunch(&self.variables()?)?,
            None => json!({}),
        };
        self.client.patch(
            &self.resource_url("exclusion"),
            &json!({"expression": expression}),
        )
    }

    /// The current exclusion expression, if any.
    pub fn exclusion(&self) -> Result<Option<Value>> {
        let entity: ShojiEntity = self.client.get_json(&self.resource_url("exclusion"))?;
        let expression = entity.body.get("expression").cloned().unwrap_or(Value::Null);
        Ok(match expression {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            other => Some(other),
        })
    }

    /// Creates a savepoint. Descriptions identify savepoints, so reusing
    /// one is rejected.
    pub fn create_savepoint(&self, description: &str) -> Result<()> {
        if self
            .savepoint_descriptions()?
            .iter()
            .any(|d| d == description)
        {
            bail!(
                "a savepoint with the description '{}' already exists",
                description
            );
        }
        self.client.post_tracked(
            &self.resource_url("savepoints"),
            &entity_wrapper(json!({"description": description})),
        )?;
        Ok(())
    }

    pub fn savepoint_descriptions(&self) -> Result<Vec<String>> {
        let catalog: ShojiCatalog = self.client.get_json(&self.resource_url("savepoints"))?;
        Ok(catalog
            .index
            .values()
            .filter_map(|tuple| tuple.get("description").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Rolls the dataset back to a savepoint (the initial import when no
    /// description is given). Savepoints taken after the loaded one are
    /// destroyed by the server.
    pub fn load_savepoint(&self, description: Option<&str>) -> Result<()> {
        let description = description.unwrap_or("initial import");
        let catalog: ShojiCatalog = self.client.get_json(&self.resource_url("savepoints"))?;
        let revert = catalog
            .index
            .values()
            .find(|tuple| tuple.get("description").and_then(Value::as_str) == Some(description))
            .and_then(|tuple| tuple.get("revert").and_then(Value::as_str))
            .ok_or_else(|| {
                anyhow!("no savepoint with the description '{}' exists", description)
            })?;
        self.client.post_tracked(revert, &json!({}))?;
        Ok(())
    }

    /// Creates a fork of the dataset and returns it.
    pub fn fork(&self, options: &ForkOptions) -> Result<Dataset> {
        let forks_url = self.resource_url("forks");
        let catalog: ShojiCatalog = self.client.get_json(&forks_url)?;
        let nforks = catalog.index.len();

        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("FORK #{} of {}", nforks + 1, self.body.name));
        let description = options
            .description
            .clone()
            .unwrap_or_else(|| self.body.description.clone());

        let mut body = json!({
            "name": name,
            "description": description,
            "is_published": options.is_published,
        });
        if options.preserve_owner && !self.body.owner.is_null() {
            body["owner"] = self.body.owner.clone();
        }

        let location = self
            .client
            .post_tracked(&forks_url, &entity_wrapper(body))?
            .ok_or_else(|| anyhow!("fork creation returned no Location"))?;
        Dataset::fetch(&self.client, &location)
    }

    /// Left-joins variables from another dataset on a key variable. The
    /// server performs the join; this call blocks until it completes.
    pub fn join(&self, spec: &JoinSpec<'_>) -> Result<()> {
        let left_catalog = self.variables()?;
        let (left_url, _) = left_catalog
            .find(spec.left_on)
            .ok_or_else(|| anyhow!("dataset has no variable '{}'", spec.left_on))?;
        let right_catalog = spec.right.variables()?;
        let (right_url, _) = right_catalog
            .find(spec.right_on)
            .ok_or_else(|| anyhow!("right dataset has no variable '{}'", spec.right_on))?;

        let adapter = json!({
            "function": "adapt",
            "args": [
                {"dataset": spec.right.url()},
                {"variable": right_url},
                {"variable": left_url},
            ],
        });

        let mut body = adapter.clone();
        if let Some(columns) = &spec.columns {
            let mut map = Map::new();
            for column in columns {
                let (url, _) = right_catalog
                    .find(column)
                    .ok_or_else(|| anyhow!("right dataset has no variable '{}'", column))?;
                map.insert(url.to_string(), json!({"variable": url}));
            }
            body = json!({
                "frame": adapter,
                "function": "select",
                "args": [{"map": map}],
            });
        }
        if let Some(filter) = &spec.filter {
            body["filter"] = json!({"expression": filter.to_crunch(&right_catalog)?});
        }

        self.client
            .post_tracked(&self.resource_url("variables"), &entity_wrapper(body))?;
        Ok(())
    }

    /// Exports the dataset and downloads the produced file to `path`.
    pub fn export(&self, path: &Path, options: ExportOptions) -> Result<PathBuf> {
        let mut payload = json!({
            "options": export_body_options(options.format, options.options.as_ref())?,
        });

        if options.filter.is_some() || options.variables.is_some() {
            let catalog = self.variables()?;
            if let Some(filter) = &options.filter {
                payload["filter"] = filter.to_crunch(&catalog)?;
            }
            if let Some(variables) = &options.variables {
                let mut map = Map::new();
                for reference in variables {
                    let (url, _) = catalog
                        .find(reference)
                        .ok_or_else(|| anyhow!("dataset has no variable '{}'", reference))?;
                    map.insert(url.to_string(), json!({"variable": url}));
                }
                payload["where"] = json!({
                    "function": "select",
                    "args": [{"map": map}],
                });
            }
        }

        let export_url = subresource(&self.resource_url("export"), options.format.as_str());
        let location = self
            .client
            .post_tracked(&export_url, &payload)?
            .ok_or_else(|| anyhow!("export reply carried no download location"))?;
        self.client.download(&location, path)
    }

    /// The hierarchical order of the dataset's variables.
    pub fn order(&self) -> Result<VariableOrder> {
        let variables_url = self.resource_url("variables");
        let hier_url = subresource(&variables_url, "hier");
        VariableOrder::fetch(&self.client, &hier_url, &variables_url)
    }

    /// Derives a new categorical (or multiple-response) variable from
    /// `case` rules evaluated against existing variables.
    pub fn create_categorical(
        &self,
        rules: &[CaseRule],
        alias: &str,
        name: &str,
        multiple: bool,
        description: &str,
    ) -> Result<Variable> {
        let catalog = self.variables()?;
        let body = if multiple {
            multiple_case_payload(rules, name, alias, description, "", &catalog)?
        } else {
            single_case_payload(rules, name, alias, description, "", &catalog)?
        };
        self.create_variable_from(body, alias)
    }

    /// Derives a new variable that recodes an existing categorical
    /// variable's categories.
    pub fn combine_categorical(
        &self,
        variable: &str,
        combinations: &[CategoryCombination],
        name: &str,
        alias: &str,
        description: &str,
    ) -> Result<Variable> {
        if name.is_empty() || alias.is_empty() {
            bail!("name and alias are required");
        }
        let catalog = self.variables()?;
        let (variable_url, _) = catalog
            .find(variable)
            .ok_or_else(|| anyhow!("dataset has no variable '{}'", variable))?;
        let body = json!({
            "name": name,
            "alias": alias,
            "description": description,
            "derivation": combine_categories_expr(variable_url, combinations_payload(combinations)),
        });
        self.create_variable_from(body, alias)
    }

    /// Derives a new multiple-response variable that combines an existing
    /// one's responses.
    pub fn combine_responses(
        &self,
        variable: &str,
        combinations: &[ResponseCombination],
        name: &str,
        alias: &str,
        description: &str,
    ) -> Result<Variable> {
        if name.is_empty() || alias.is_empty() {
            bail!("name and alias are required");
        }
        let parent = self.variable(variable)?;
        let responses = responses_payload(
            combinations,
            alias,
            parent.alias(),
            &parent.subvar_urls_by_alias(),
        )?;
        let body = json!({
            "name": name,
            "alias": alias,
            "description": description,
            "derivation": combine_responses_expr(parent.url(), responses),
        });
        self.create_variable_from(body, alias)
    }

    fn create_variable_from(&self, body: Value, alias: &str) -> Result<Variable> {
        let location = self
            .client
            .post_tracked(&self.resource_url("variables"), &entity_wrapper(body))?;
        match location {
            Some(url) => Variable::fetch(&self.client, &url),
            // Some creation endpoints reply without a Location header; the
            // new variable is findable through the refreshed catalog.
            None => self.variable(alias),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> VariableCatalog {
        let doc = json!({
            "element": "shoji:catalog",
            "index": {
                "https://h/api/datasets/d/variables/0001/": {
                    "id": "0001", "alias": "age", "name": "Age", "type": "numeric",
                },
                "https://h/api/datasets/d/variables/0002/": {
                    "id": "0002", "alias": "q1", "name": "Favorite drink", "type": "categorical",
                },
                "https://h/api/datasets/d/variables/0003/": {
                    "id": "0003", "alias": "age_group", "name": "age", "type": "categorical",
                    "derived": true,
                },
            },
        });
        let parsed: ShojiCatalog = serde_json::from_value(doc).unwrap();
        VariableCatalog::from_catalog(parsed)
    }

    #[test]
    fn catalog_lookup_prefers_alias_over_name_over_id() {
        let catalog = catalog();
        // "age" is an alias of 0001 and the *name* of 0003; alias wins.
        let (url, def) = catalog.find("age").unwrap();
        assert!(url.ends_with("/0001/"));
        assert_eq!(def.kind, "numeric");

        let (url, _) = catalog.find("Favorite drink").unwrap();
        assert!(url.ends_with("/0002/"));

        let (url, def) = catalog.find("0003").unwrap();
        assert!(url.ends_with("/0003/"));
        assert!(def.derived);

        assert!(catalog.find("ghost").is_none());
    }

    #[test]
    fn catalog_resolves_expression_aliases() {
        let catalog = catalog();
        assert_eq!(
            catalog.variable_url("q1").as_deref(),
            Some("https://h/api/datasets/d/variables/0002/")
        );
        // The resolver is strict: names do not resolve in expressions.
        assert_eq!(catalog.variable_url("Favorite drink"), None);
    }

    #[test]
    fn export_options_defaults_and_validation() {
        let csv = export_body_options(ExportFormat::Csv, None).unwrap();
        assert_eq!(csv, json!({"use_category_ids": true}));

        let spss = export_body_options(ExportFormat::Spss, None).unwrap();
        assert_eq!(spss["var_label_field"], "description");

        let mut extra = Map::new();
        extra.insert("use_category_ids".into(), json!(false));
        let merged = export_body_options(ExportFormat::Csv, Some(&extra)).unwrap();
        assert_eq!(merged, json!({"use_category_ids": false}));

        let mut bad = Map::new();
        bad.insert("page_size".into(), json!(100));
        assert!(export_body_options(ExportFormat::Csv, Some(&bad)).is_err());

        let mut bad_label = Map::new();
        bad_label.insert("var_label_field".into(), json!("alias"));
        assert!(export_body_options(ExportFormat::Spss, Some(&bad_label)).is_err());
    }

    #[test]
    fn fork_options_default_to_preserving_the_owner() {
        let options = ForkOptions::default();
        assert!(options.preserve_owner);
        assert!(!options.is_published);
        assert!(options.name.is_none());
    }

    #[test]
    fn dataset_body_tolerates_sparse_documents() {
        let body: DatasetBody =
            serde_json::from_value(json!({"name": "Survey", "id": "abc"})).unwrap();
        assert_eq!(body.name, "Survey");
        assert!(body.owner.is_null());
        assert!(body.streaming.is_none());

        let streaming: DatasetBody =
            serde_json::from_value(json!({"name": "S", "streaming": "streaming"})).unwrap();
        assert_eq!(streaming.streaming.as_deref(), Some("streaming"));
    }
}
