use serde::Serializer;

/// A discrete, tagged note for graphite-web's events API.
///
/// Serializes to the body graphite-web expects: `tags` go over the wire as a
/// single space-joined string.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Annotation {
    /// Short headline of the event.
    pub what: String,
    /// Tags, already expanded. See `expand_tags`.
    #[serde(serialize_with = "join_tags")]
    pub tags: Vec<String>,
    /// Seconds since the Unix epoch.
    pub when: i64,
    /// Free-form detail.
    pub data: String,
}

fn join_tags<S>(tags: &[String], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tags.join(" "))
}

/// Expand a service's tags for annotation.
///
/// The result always leads with `watchmen` and the service name, then every
/// tag twice: bare, and prefixed with the service name.
pub fn expand_tags(service: &str, tags: &[String]) -> Vec<String> {
    let mut expanded = Vec::with_capacity(2 + tags.len() * 2);
    expanded.push("watchmen".to_string());
    expanded.push(service.to_string());
    for tag in tags {
        expanded.push(tag.clone());
        expanded.push(format!("{}_{}", service, tag));
    }
    expanded
}

impl Annotation {
    /// Create an `Annotation` about `service`, expanding `tags`.
    pub fn new<S>(service: &str, what: S, tags: &[String], when: i64, data: S) -> Annotation
    where
        S: Into<String>,
    {
        Annotation {
            what: what.into(),
            tags: expand_tags(service, tags),
            when: when,
            data: data.into(),
        }
    }
}
