use anyhow::anyhow;
use reqwest::StatusCode;
use thiserror::Error;

/// Failures raised by the hierarchical-order editor. Lookup and validation
/// errors surface before any mutation happens, so the local tree is
/// untouched; a rejected write ([`OrderError::UpdateRejected`]) reloads the
/// tree from the server instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("invalid path {path}: element {element} does not exist")]
    PathNotFound { path: String, element: String },
    #[error("invalid path {path}: element {element} is not a group")]
    NotAGroup { path: String, element: String },
    #[error("invalid path {0}: only absolute paths are allowed")]
    RelativePath(String),
    #[error("invalid reference '{0}': it is not part of the hierarchy")]
    UnknownReference(String),
    #[error("invalid anchor '{0}': it is not part of the target group")]
    UnknownAnchor(String),
    #[error("a variable or group named '{0}' already exists in the target group")]
    DuplicateName(String),
    #[error("invalid character in group name: '{0}'")]
    InvalidName(String),
    #[error("invalid position {position} for a group of {len} elements")]
    PositionOutOfRange { position: usize, len: usize },
    #[error("invalid list of items for the reorder operation")]
    IncompleteReorder,
    #[error("the root group cannot be renamed, moved or deleted")]
    RootIsImmutable,
    #[error("cannot delete group '{0}': it still contains elements")]
    GroupNotEmpty(String),
    #[error("cannot move group '{0}' into its own subtree")]
    MoveIntoSelf(String),
    #[error("invalid order graph element: {0}")]
    InvalidGraph(String),
    #[error("order update rejected by the server: {0}")]
    UpdateRejected(String),
}

/// Error document returned by the API. Crunch wraps failures in a
/// `shoji:exception` envelope; some endpoints respond with a bare
/// `{"message": ...}` instead.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ApiErrorResponse {
    #[serde(default)]
    pub(crate) element: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default, rename = "type")]
    pub(crate) kind: Option<String>,
}

pub(crate) fn format_api_error(
    status: StatusCode,
    url: &str,
    e: &ApiErrorResponse,
) -> anyhow::Error {
    let message = e.message.as_deref().or(e.description.as_deref()).unwrap_or("");
    let kind = e.kind.as_deref().or(e.element.as_deref()).unwrap_or("");

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return anyhow!(
            "Crunch authentication/authorization failed (HTTP {}).\n- Check that CRUNCH_API_KEY holds a valid, unexpired API key (or that your username/password are correct)\n- Verify your account has access to the resource; editor-only operations fail with 403 for viewers\n\nServer message: {}\nkind: {}\nrequest: {}",
            status.as_u16(),
            message,
            kind,
            url
        );
    }

    if status == StatusCode::NOT_FOUND {
        return anyhow!(
            "Crunch API resource not found (HTTP 404).\n- Check the configured base URL (typically https://your-domain.crunch.io/api)\n- The dataset or variable may have been deleted or renamed on the server\n\nServer message: {}\nrequest: {}",
            message,
            url
        );
    }

    anyhow!(
        "API request failed: HTTP {} for url ({})\n{}",
        status.as_u16(),
        url,
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_shoji_exception() {
        let body = r#"{"element": "shoji:exception", "message": "no such variable"}"#;
        let parsed: ApiErrorResponse = serde_json::from_str(body).unwrap();
        let err = format_api_error(StatusCode::NOT_FOUND, "https://host/api/x/", &parsed);
        let text = err.to_string();
        assert!(text.contains("HTTP 404"));
        assert!(text.contains("no such variable"));
    }

    #[test]
    fn forbidden_mentions_api_key() {
        let parsed: ApiErrorResponse = serde_json::from_str("{}").unwrap();
        let err = format_api_error(StatusCode::FORBIDDEN, "https://host/api/x/", &parsed);
        assert!(err.to_string().contains("CRUNCH_API_KEY"));
    }

    #[test]
    fn order_error_messages() {
        let err = OrderError::PathNotFound {
            path: "| Group A | Missing".into(),
            element: "Missing".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid path | Group A | Missing: element Missing does not exist"
        );
        assert_eq!(
            OrderError::IncompleteReorder.to_string(),
            "invalid list of items for the reorder operation"
        );
    }
}
