use anyhow::{Result, bail};
use serde_json::{Value, json};

/// Resolves a variable alias to its entity URL. Implemented by
/// [`crate::VariableCatalog`]; tests provide table-backed stand-ins.
pub trait VariableResolver {
    fn variable_url(&self, alias: &str) -> Option<String>;
}

/// A filter expression over dataset variables, serialized to the API's
/// function-call JSON (`{"function": f, "args": [...]}`).
///
/// Variables are referenced by alias and resolved to entity URLs when the
/// expression is serialized against a dataset's variable catalog:
///
/// ```
/// use scrunch::Expr;
///
/// let keep_young_respondents = Expr::var("age").lt(30).and(Expr::var("wave").ne(0));
/// ```
#[derive(Debug, Clone)]
pub enum Expr {
    /// A variable reference by alias.
    Var(String),
    /// A literal value.
    Val(Value),
    /// A function of one argument (`not`, `is_missing`, `is_valid`).
    Unary { func: &'static str, arg: Box<Expr> },
    /// A function of two arguments (comparisons, `in`, `and`, `or`,
    /// `any`, `all`).
    Binary {
        func: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn var(alias: impl Into<String>) -> Self {
        Expr::Var(alias.into())
    }

    pub fn val(value: impl Into<Value>) -> Self {
        Expr::Val(value.into())
    }

    pub fn eq(self, value: impl Into<Value>) -> Self {
        self.binary("==", Expr::Val(value.into()))
    }

    pub fn ne(self, value: impl Into<Value>) -> Self {
        self.binary("!=", Expr::Val(value.into()))
    }

    pub fn lt(self, value: impl Into<Value>) -> Self {
        self.binary("<", Expr::Val(value.into()))
    }

    pub fn le(self, value: impl Into<Value>) -> Self {
        self.binary("<=", Expr::Val(value.into()))
    }

    pub fn gt(self, value: impl Into<Value>) -> Self {
        self.binary(">", Expr::Val(value.into()))
    }

    pub fn ge(self, value: impl Into<Value>) -> Self {
        self.binary(">=", Expr::Val(value.into()))
    }

    /// Membership test against a list of values.
    pub fn is_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.binary("in", Expr::Val(Value::Array(values)))
    }

    /// True where any of the given category ids is selected
    /// (multiple-response variables).
    pub fn any<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.binary("any", Expr::Val(Value::Array(values)))
    }

    /// True where all of the given category ids are selected
    /// (multiple-response variables).
    pub fn all<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.binary("all", Expr::Val(Value::Array(values)))
    }

    pub fn and(self, other: Expr) -> Self {
        self.binary("and", other)
    }

    pub fn or(self, other: Expr) -> Self {
        self.binary("or", other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Unary {
            func: "not",
            arg: Box::new(self),
        }
    }

    /// True where the variable holds a missing value.
    pub fn is_missing(self) -> Self {
        Expr::Unary {
            func: "is_missing",
            arg: Box::new(self),
        }
    }

    /// True where the variable holds a valid (non-missing) value.
    pub fn is_valid(self) -> Self {
        Expr::Unary {
            func: "is_valid",
            arg: Box::new(self),
        }
    }

    fn binary(self, func: &'static str, right: Expr) -> Self {
        Expr::Binary {
            func,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    /// Serializes the expression to API JSON, resolving every variable
    /// alias to its entity URL. Unresolved aliases are errors.
    pub fn to_crunch(&self, resolver: &dyn VariableResolver) -> Result<Value> {
        match self {
            Expr::Var(alias) => match resolver.variable_url(alias) {
                Some(url) => Ok(json!({"variable": url})),
                None => bail!("unknown variable alias '{}'", alias),
            },
            Expr::Val(value) => Ok(json!({"value": value})),
            Expr::Unary { func, arg } => Ok(json!({
                "function": func,
                "args": [arg.to_crunch(resolver)?],
            })),
            Expr::Binary { func, left, right } => Ok(json!({
                "function": func,
                "args": [left.to_crunch(resolver)?, right.to_crunch(resolver)?],
            })),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct FixedResolver(pub HashMap<String, String>);

    impl FixedResolver {
        pub(crate) fn with(pairs: &[(&str, &str)]) -> Self {
            Self(
                pairs
                    .iter()
                    .map(|(a, u)| (a.to_string(), u.to_string()))
                    .collect(),
            )
        }
    }

    impl VariableResolver for FixedResolver {
        fn variable_url(&self, alias: &str) -> Option<String> {
            self.0.get(alias).cloned()
        }
    }

    #[test]
    fn comparison_shape() {
        let resolver = FixedResolver::with(&[("age", "https://host/api/datasets/d/variables/1/")]);
        let value = Expr::var("age").gt(30).to_crunch(&resolver).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "function": ">",
                "args": [
                    {"variable": "https://host/api/datasets/d/variables/1/"},
                    {"value": 30},
                ],
            })
        );
    }

    #[test]
    fn composed_logic_shape() {
        let resolver = FixedResolver::with(&[
            ("age", "https://h/api/d/v/1/"),
            ("q1", "https://h/api/d/v/2/"),
        ]);
        let expr = Expr::var("age").is_in([1, 2, 3]).and(Expr::var("q1").is_missing().not());
        let value = expr.to_crunch(&resolver).unwrap();
        assert_eq!(value["function"], "and");
        assert_eq!(value["args"][0]["function"], "in");
        assert_eq!(value["args"][0]["args"][1]["value"], serde_json::json!([1, 2, 3]));
        assert_eq!(value["args"][1]["function"], "not");
        assert_eq!(value["args"][1]["args"][0]["function"], "is_missing");
    }

    #[test]
    fn unresolved_alias_is_an_error() {
        let resolver = FixedResolver::with(&[]);
        let err = Expr::var("ghost").eq(1).to_crunch(&resolver).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
