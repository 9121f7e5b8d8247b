use anyhow::{Result, bail};
use indexmap::IndexMap;
use serde_json::{Map, Value, json};

use crate::expr::{Expr, VariableResolver};

// Ids of the default categories backing multiple-response subvariables.
pub(crate) const SELECTED_ID: i64 = 1;
pub(crate) const NOT_SELECTED_ID: i64 = 2;
pub(crate) const NO_DATA_ID: i64 = -1;

/// One target category (or multiple-response subvariable) of a `case`
/// derivation. `case: None` marks the `else` rule, which matches whatever
/// the other rules do not.
#[derive(Debug, Clone)]
pub struct CaseRule {
    pub id: i64,
    pub name: String,
    pub case: Option<Expr>,
}

/// One combined category of a `combine_categories` recode: the new
/// category and the source category ids collapsed into it.
#[derive(Debug, Clone)]
pub struct CategoryCombination {
    pub id: i64,
    pub name: String,
    pub sources: Vec<i64>,
    pub missing: bool,
}

/// One combined response of a `combine_responses` recode: the new
/// subvariable and the source response ids collapsed into it.
#[derive(Debug, Clone)]
pub struct ResponseCombination {
    pub id: i64,
    pub name: String,
    pub sources: Vec<i64>,
}

/// Alias given to a derived subvariable, `<parent alias>_<response id>`.
pub(crate) fn subvar_alias(parent_alias: &str, response_id: i64) -> String {
    format!("{}_{}", parent_alias, response_id)
}

/// The `combine_categories` argument list, sorted by target category id.
pub(crate) fn combinations_payload(combinations: &[CategoryCombination]) -> Vec<Value> {
    let mut sorted: Vec<&CategoryCombination> = combinations.iter().collect();
    sorted.sort_by_key(|c| c.id);
    sorted
        .into_iter()
        .map(|c| {
            json!({
                "id": c.id,
                "name": c.name,
                "missing": c.missing,
                "combined_ids": c.sources,
            })
        })
        .collect()
}

/// The `combine_responses` argument list. Source response ids are resolved
/// to subvariable URLs through the parent's subvariable aliases; an unknown
/// source id is bad input.
pub(crate) fn responses_payload(
    combinations: &[ResponseCombination],
    alias: &str,
    parent_alias: &str,
    subvar_urls: &IndexMap<String, String>,
) -> Result<Vec<Value>> {
    let mut sorted: Vec<&ResponseCombination> = combinations.iter().collect();
    sorted.sort_by_key(|c| c.id);

    let mut responses = Vec::with_capacity(sorted.len());
    for comb in sorted {
        let mut combined = Vec::with_capacity(comb.sources.len());
        for source_id in &comb.sources {
            let source_alias = subvar_alias(parent_alias, *source_id);
            match subvar_urls.get(&source_alias) {
                Some(url) => combined.push(url.clone()),
                None => bail!("unknown subvariables for variable {}", parent_alias),
            }
        }
        responses.push(json!({
            "name": comb.name,
            "alias": subvar_alias(alias, comb.id),
            "combined_ids": combined,
        }));
    }
    Ok(responses)
}

pub(crate) fn combine_categories_expr(variable_url: &str, combinations: Vec<Value>) -> Value {
    json!({
        "function": "combine_categories",
        "args": [
            {"var": variable_url},
            {"value": combinations},
        ],
    })
}

pub(crate) fn combine_responses_expr(variable_url: &str, responses: Vec<Value>) -> Value {
    json!({
        "function": "combine_responses",
        "args": [
            {"variable": variable_url},
            {"value": responses},
        ],
    })
}

/// A `case` function expression: the category column and type, followed by
/// one membership expression per category.
pub(crate) fn case_expr(cases: Vec<Value>, name: &str, alias: &str, categories: Vec<Value>) -> Value {
    let column: Vec<Value> = categories.iter().map(|c| c["id"].clone()).collect();
    let mut args = vec![json!({
        "column": column,
        "type": {"value": {"class": "categorical", "categories": categories}},
    })];
    args.extend(cases);
    json!({
        "references": {"name": name, "alias": alias},
        "function": "case",
        "args": args,
    })
}

pub(crate) fn default_mr_categories() -> Vec<Value> {
    vec![
        json!({"id": SELECTED_ID, "name": "Selected", "missing": false, "numeric_value": null, "selected": true}),
        json!({"id": NOT_SELECTED_ID, "name": "Not selected", "missing": false, "numeric_value": null, "selected": false}),
    ]
}

/// The `else` rule matches whatever no explicit rule matched: the
/// conjunction of the negated explicit cases.
fn else_expr(rules: &[CaseRule]) -> Result<Expr> {
    let mut negated = rules
        .iter()
        .filter_map(|r| r.case.as_ref())
        .map(|case| case.clone().not());
    let Some(first) = negated.next() else {
        bail!("an 'else' rule requires at least one explicit rule");
    };
    Ok(negated.fold(first, |acc, e| acc.and(e)))
}

fn validate_rules(rules: &[CaseRule]) -> Result<()> {
    if rules.is_empty() {
        bail!("at least one case rule is required");
    }
    let mut seen = std::collections::HashSet::new();
    for rule in rules {
        if !seen.insert(rule.id) {
            bail!("duplicate case rule id {}", rule.id);
        }
    }
    if rules.iter().filter(|r| r.case.is_none()).count() > 1 {
        bail!("at most one 'else' rule is allowed");
    }
    Ok(())
}

/// Body of a categorical `case` derivation: one category per rule plus a
/// missing `No Data` bucket.
pub(crate) fn single_case_payload(
    rules: &[CaseRule],
    name: &str,
    alias: &str,
    description: &str,
    notes: &str,
    resolver: &dyn VariableResolver,
) -> Result<Value> {
    validate_rules(rules)?;

    let mut categories: Vec<Value> = rules
        .iter()
        .map(|r| json!({"id": r.id, "name": r.name, "numeric_value": null, "missing": false}))
        .collect();
    categories.push(json!({
        "id": NO_DATA_ID, "name": "No Data", "numeric_value": null, "missing": true,
    }));

    let mut column: Vec<i64> = rules.iter().map(|r| r.id).collect();
    column.push(NO_DATA_ID);

    let mut args = vec![json!({
        "column": column,
        "type": {"value": {"class": "categorical", "categories": categories}},
    })];
    for rule in rules {
        let case = match &rule.case {
            Some(case) => case.clone(),
            None => else_expr(rules)?,
        };
        args.push(case.to_crunch(resolver)?);
    }

    Ok(json!({
        "alias": alias,
        "name": name,
        "expr": {"function": "case", "args": args},
        "description": description,
        "notes": notes,
    }))
}

/// Body of a multiple-response `case` derivation: one Selected/Not-selected
/// subvariable per rule, wrapped in an `array(select(...))` derivation.
pub(crate) fn multiple_case_payload(
    rules: &[CaseRule],
    name: &str,
    alias: &str,
    description: &str,
    notes: &str,
    resolver: &dyn VariableResolver,
) -> Result<Value> {
    validate_rules(rules)?;

    let mut sorted: Vec<&CaseRule> = rules.iter().collect();
    sorted.sort_by_key(|r| r.id);

    let mut responses_map = Map::new();
    let mut keys = Vec::with_capacity(sorted.len());
    for rule in sorted {
        let case = match &rule.case {
            Some(case) => case.clone(),
            None => else_expr(rules)?,
        };
        let key = format!("{:04}", rule.id);
        responses_map.insert(
            key.clone(),
            case_expr(
                vec![case.to_crunch(resolver)?],
                &rule.name,
                &subvar_alias(alias, rule.id),
                default_mr_categories(),
            ),
        );
        keys.push(key);
    }

    Ok(json!({
        "name": name,
        "alias": alias,
        "description": description,
        "notes": notes,
        "derivation": {
            "function": "array",
            "args": [{
                "function": "select",
                "args": [
                    {"map": responses_map},
                    {"value": keys},
                ],
            }],
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::tests::FixedResolver;

    fn rules() -> Vec<CaseRule> {
        vec![
            CaseRule {
                id: 1,
                name: "Millennial".into(),
                case: Some(Expr::var("age").lt(25)),
            },
            CaseRule {
                id: 2,
                name: "Gen X".into(),
                case: Some(Expr::var("age").ge(25)),
            },
            CaseRule {
                id: 3,
                name: "Other".into(),
                case: None,
            },
        ]
    }

    #[test]
    fn combinations_are_sorted_by_id() {
        let payload = combinations_payload(&[
            CategoryCombination {
                id: 2,
                name: "high".into(),
                sources: vec![4, 5],
                missing: false,
            },
            CategoryCombination {
                id: 1,
                name: "low".into(),
                sources: vec![1],
                missing: false,
            },
            CategoryCombination {
                id: 9,
                name: "no answer".into(),
                sources: vec![9],
                missing: true,
            },
        ]);
        let ids: Vec<i64> = payload.iter().map(|c| c["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, [1, 2, 9]);
        assert_eq!(payload[0]["combined_ids"], json!([1]));
        assert_eq!(payload[2]["missing"], json!(true));
    }

    #[test]
    fn responses_resolve_source_subvariables() {
        let mut subvars = IndexMap::new();
        subvars.insert("q1_1".to_string(), "https://h/api/d/v/1/s/1/".to_string());
        subvars.insert("q1_2".to_string(), "https://h/api/d/v/1/s/2/".to_string());

        let payload = responses_payload(
            &[ResponseCombination {
                id: 1,
                name: "online".into(),
                sources: vec![1, 2],
            }],
            "q1_recoded",
            "q1",
            &subvars,
        )
        .unwrap();
        assert_eq!(payload[0]["alias"], "q1_recoded_1");
        assert_eq!(
            payload[0]["combined_ids"],
            json!(["https://h/api/d/v/1/s/1/", "https://h/api/d/v/1/s/2/"])
        );
    }

    #[test]
    fn unknown_response_source_is_bad_input() {
        let subvars = IndexMap::new();
        let err = responses_payload(
            &[ResponseCombination {
                id: 1,
                name: "x".into(),
                sources: vec![7],
            }],
            "a",
            "q1",
            &subvars,
        )
        .unwrap_err();
        assert!(err.to_string().contains("q1"));
    }

    #[test]
    fn combine_envelopes() {
        let cats = combine_categories_expr("https://h/api/d/v/1/", vec![json!({"id": 1})]);
        assert_eq!(cats["function"], "combine_categories");
        assert_eq!(cats["args"][0]["var"], "https://h/api/d/v/1/");

        let resps = combine_responses_expr("https://h/api/d/v/1/", vec![]);
        assert_eq!(resps["function"], "combine_responses");
        assert_eq!(resps["args"][0]["variable"], "https://h/api/d/v/1/");
    }

    #[test]
    fn single_case_payload_shape() {
        let resolver = FixedResolver::with(&[("age", "https://h/api/d/v/1/")]);
        let body = single_case_payload(&rules(), "Generation", "generation", "", "", &resolver)
            .unwrap();
        assert_eq!(body["expr"]["function"], "case");
        let args = body["expr"]["args"].as_array().unwrap();
        // column/type argument plus one case per rule
        assert_eq!(args.len(), 4);
        assert_eq!(args[0]["column"], json!([1, 2, 3, -1]));
        let cats = args[0]["type"]["value"]["categories"].as_array().unwrap();
        assert_eq!(cats.last().unwrap()["name"], "No Data");
        // the else rule is the conjunction of the negated explicit rules
        assert_eq!(args[3]["function"], "and");
    }

    #[test]
    fn multiple_case_payload_shape() {
        let resolver = FixedResolver::with(&[("age", "https://h/api/d/v/1/")]);
        let body = multiple_case_payload(
            &rules()[..2],
            "Generations",
            "gens",
            "",
            "",
            &resolver,
        )
        .unwrap();
        let select = &body["derivation"]["args"][0];
        assert_eq!(select["function"], "select");
        assert_eq!(select["args"][1]["value"], json!(["0001", "0002"]));
        let sub = &select["args"][0]["map"]["0001"];
        assert_eq!(sub["references"]["alias"], "gens_1");
        assert_eq!(sub["args"][0]["column"], json!([1, 2]));
    }

    #[test]
    fn duplicate_rule_ids_rejected() {
        let bad = vec![
            CaseRule { id: 1, name: "a".into(), case: Some(Expr::var("x").eq(1)) },
            CaseRule { id: 1, name: "b".into(), case: Some(Expr::var("x").eq(2)) },
        ];
        let resolver = FixedResolver::with(&[("x", "https://h/v/1/")]);
        assert!(single_case_payload(&bad, "n", "a", "", "", &resolver).is_err());
    }
}
