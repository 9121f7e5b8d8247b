use std::time::Duration;

pub(crate) fn retriable_status(code: u16) -> bool {
    matches!(code, 500 | 502 | 503 | 504 | 429 | 408)
}

pub(crate) fn backoff(current: Duration, max: Duration) -> Duration {
    let next = Duration::from_secs_f64((current.as_secs_f64() * 1.5).max(1.0));
    if next > max { max } else { next }
}

pub(crate) fn guess_filename_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    path.trim_end_matches('/').rsplit('/').next().and_then(|s| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    })
}

pub(crate) fn urljoin(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Joins a Shoji resource URL with a child segment. Crunch resource URLs
/// always carry a trailing slash.
pub(crate) fn subresource(url: &str, name: &str) -> String {
    format!("{}/{}/", url.trim_end_matches('/'), name)
}

/// Extracts the entity id from a Shoji URL, i.e. the last non-empty path
/// segment of `https://host/api/datasets/<id>/` or of a relative `../<id>/`.
pub(crate) fn element_id_from_url(url: &str) -> Option<&str> {
    url.split('?')
        .next()
        .unwrap_or(url)
        .split('/')
        .rev()
        .find(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_statuses() {
        for code in [500, 502, 503, 504, 429, 408] {
            assert!(retriable_status(code));
        }
        for code in [200, 201, 202, 301, 400, 401, 403, 404, 409] {
            assert!(!retriable_status(code));
        }
    }

    #[test]
    fn backoff_is_capped() {
        let max = Duration::from_secs(8);
        let mut sleep = Duration::from_secs(1);
        for _ in 0..20 {
            sleep = backoff(sleep, max);
            assert!(sleep <= max);
        }
        assert_eq!(sleep, max);
    }

    #[test]
    fn filename_guessing() {
        assert_eq!(
            guess_filename_from_url("https://host/files/export.csv?expires=1").as_deref(),
            Some("export.csv")
        );
        assert_eq!(guess_filename_from_url("https://host/"), Some("host".into()));
    }

    #[test]
    fn url_joining() {
        assert_eq!(urljoin("https://host/api/", "/files/x"), "https://host/api/files/x");
        assert_eq!(urljoin("https://host/api", "files/x"), "https://host/api/files/x");
        assert_eq!(urljoin("https://host/api", "https://cdn/x"), "https://cdn/x");
    }

    #[test]
    fn subresource_keeps_trailing_slash() {
        assert_eq!(
            subresource("https://host/api/datasets/abc/", "exclusion"),
            "https://host/api/datasets/abc/exclusion/"
        );
    }

    #[test]
    fn id_extraction() {
        assert_eq!(
            element_id_from_url("https://host/api/datasets/42ad/variables/0007/"),
            Some("0007")
        );
        assert_eq!(element_id_from_url("../cafe/"), Some("cafe"));
        assert_eq!(element_id_from_url(""), None);
    }
}
