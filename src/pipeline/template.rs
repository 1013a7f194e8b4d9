// Path templates. `{var}` and `{var.field}` substitute from the pipeline
// vars; the interpolated path names the cache entry on disk, so the same
// vars must always produce the same path.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::vars::Vars;
use super::PipelineError;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*)\}").unwrap());

pub fn interpolate(template: &str, vars: &Vars) -> Result<String, PipelineError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let name = &caps[1];

        out.push_str(&template[last..whole.start()]);
        let value = vars
            .lookup(name)
            .ok_or_else(|| PipelineError::MissingVar(name.to_owned()))?;
        out.push_str(&render(name, value)?);
        last = whole.end();
    }
    out.push_str(&template[last..]);

    if out.split('/').any(|seg| seg == "..") {
        return Err(PipelineError::BadTemplate(template.to_owned()));
    }
    Ok(out)
}

fn render(name: &str, value: &Value) -> Result<String, PipelineError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(PipelineError::MissingVar(name.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Vars {
        let mut vars = Vars::new();
        vars.set(
            "ctx",
            json!({"account": "acme", "repo": "site", "auth": {"group": "g1f2"}}),
        );
        vars.set("commit", "abcd123");
        vars
    }

    #[test]
    fn substitutes_nested_fields() {
        let path = interpolate(
            "internal/{ctx.account}/{ctx.repo}/records-{commit}.jsonl",
            &vars(),
        )
        .unwrap();
        assert_eq!(path, "internal/acme/site/records-abcd123.jsonl");
    }

    #[test]
    fn deep_lookup_through_auth() {
        let path = interpolate("r-{commit}-{ctx.auth.group}.jsonl", &vars()).unwrap();
        assert_eq!(path, "r-abcd123-g1f2.jsonl");
    }

    #[test]
    fn missing_var_is_an_error() {
        assert!(matches!(
            interpolate("{nope}", &vars()),
            Err(PipelineError::MissingVar(_))
        ));
    }

    #[test]
    fn same_vars_same_path() {
        let a = interpolate("x/{ctx.account}-{commit}", &vars()).unwrap();
        let b = interpolate("x/{ctx.account}-{commit}", &vars()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_parent_traversal() {
        let mut vars = Vars::new();
        vars.set("p", "..");
        assert!(interpolate("cache/{p}/leak", &vars).is_err());
    }
}
