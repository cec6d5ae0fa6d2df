use rpc_transport::jsonrpc::Id;

use crate::correlation::CorrelationId;
use crate::error::RpcError;

/// Where an inbound topic belongs within one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// `{prefix}/method/{method}`
    Call(String),
    /// `{prefix}/response/{correlation id}`
    Response(String),
    Unroutable,
}

/// Pure topic derivation for one namespace.
///
/// ```text
///   [root/]ns/method/<method>      calls, subscribed as  [root/]ns/method/+
///   [root/]ns/response/<cid>       replies, one exact subscription per call
/// ```
///
/// Namespaces, method names and correlation ids are single segments, so two
/// distinct inputs can never produce the same topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    namespace: String,
    prefix: String,
    method_base: String,
    response_base: String,
}

impl TopicScheme {
    pub fn new(namespace: &str) -> Result<Self, RpcError> {
        Self::with_root(None, namespace)
    }

    /// `root` may span several levels (`"mqttjsonrpc"`, `"site/a/"`); a
    /// trailing separator is ignored.
    pub fn with_root(root: Option<&str>, namespace: &str) -> Result<Self, RpcError> {
        validate_segment("namespace", namespace)?;
        let prefix = match root.map(|r| r.trim_end_matches('/')) {
            None | Some("") => namespace.to_string(),
            Some(root) => {
                for level in root.split('/') {
                    if level.is_empty() || level.contains(['+', '#']) {
                        return Err(RpcError::invalid(
                            "topic root",
                            root,
                            "levels must be non-empty and free of wildcards",
                        ));
                    }
                }
                format!("{root}/{namespace}")
            }
        };
        Ok(Self {
            namespace: namespace.to_string(),
            method_base: format!("{prefix}/method/"),
            response_base: format!("{prefix}/response/"),
            prefix,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn call_topic(&self, method: &str) -> Result<String, RpcError> {
        validate_segment("method", method)?;
        Ok(format!("{}{method}", self.method_base))
    }

    pub fn response_topic(&self, id: &CorrelationId) -> String {
        format!("{}{id}", self.response_base)
    }

    /// Response topic for an inbound call, `None` when the caller's id cannot
    /// be used as a topic level (null, or containing separators).
    pub fn reply_topic(&self, id: &Id) -> Option<String> {
        id.as_segment()
            .filter(|segment| is_segment(segment))
            .map(|segment| format!("{}{segment}", self.response_base))
    }

    pub fn method_wildcard(&self) -> String {
        format!("{}+", self.method_base)
    }

    pub fn response_wildcard(&self) -> String {
        format!("{}+", self.response_base)
    }

    pub fn classify(&self, topic: &str) -> TopicKind {
        if let Some(method) = topic.strip_prefix(&self.method_base) {
            if is_segment(method) {
                return TopicKind::Call(method.to_string());
            }
        } else if let Some(id) = topic.strip_prefix(&self.response_base) {
            if is_segment(id) {
                return TopicKind::Response(id.to_string());
            }
        }
        TopicKind::Unroutable
    }
}

fn is_segment(value: &str) -> bool {
    !value.is_empty() && !value.contains(['/', '+', '#'])
}

/// Rejects anything that would not stay a single literal topic level.
pub fn validate_segment(kind: &str, value: &str) -> Result<(), RpcError> {
    if value.is_empty() {
        return Err(RpcError::invalid(kind, value, "must not be empty"));
    }
    if value.contains('/') {
        return Err(RpcError::invalid(kind, value, "must not contain `/`"));
    }
    if value.contains(['+', '#']) {
        return Err(RpcError::invalid(kind, value, "must not contain wildcards"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_call_and_response_topics() {
        let scheme = TopicScheme::new("calc").unwrap();
        assert_eq!(scheme.call_topic("sum").unwrap(), "calc/method/sum");
        assert_eq!(scheme.method_wildcard(), "calc/method/+");
        assert_eq!(scheme.response_wildcard(), "calc/response/+");

        let id = CorrelationId::from("abc".to_string());
        assert_eq!(scheme.response_topic(&id), "calc/response/abc");
    }

    #[test]
    fn reply_topics_follow_the_caller_id() {
        let scheme = TopicScheme::new("calc").unwrap();
        assert_eq!(
            scheme.reply_topic(&Id::String("abc".into())).as_deref(),
            Some("calc/response/abc")
        );
        assert_eq!(scheme.reply_topic(&Id::Number(7)).as_deref(), Some("calc/response/7"));
        assert_eq!(scheme.reply_topic(&Id::Null), None);
        assert_eq!(scheme.reply_topic(&Id::String("a/b".into())), None);
    }

    #[test]
    fn root_is_prepended_once() {
        let scheme = TopicScheme::with_root(Some("mqttjsonrpc/"), "calc").unwrap();
        assert_eq!(scheme.prefix(), "mqttjsonrpc/calc");
        assert_eq!(scheme.call_topic("sum").unwrap(), "mqttjsonrpc/calc/method/sum");

        let scheme = TopicScheme::with_root(Some(""), "calc").unwrap();
        assert_eq!(scheme.prefix(), "calc");

        assert!(TopicScheme::with_root(Some("a//b"), "calc").is_err());
        assert!(TopicScheme::with_root(Some("a/#"), "calc").is_err());
    }

    #[test]
    fn rejects_names_that_are_not_one_segment() {
        assert!(TopicScheme::new("").is_err());
        assert!(TopicScheme::new("a/b").is_err());
        assert!(TopicScheme::new("a+").is_err());

        let scheme = TopicScheme::new("calc").unwrap();
        let err = scheme.call_topic("x/y").unwrap_err();
        assert_eq!(err.name(), "invalid_name");
        assert!(scheme.call_topic("#").is_err());
        assert!(scheme.call_topic("").is_err());
    }

    #[test]
    fn classifies_by_prefix_and_single_remainder() {
        let scheme = TopicScheme::new("calc").unwrap();
        assert_eq!(scheme.classify("calc/method/sum"), TopicKind::Call("sum".into()));
        assert_eq!(scheme.classify("calc/response/42"), TopicKind::Response("42".into()));
        assert_eq!(scheme.classify("calc/method/"), TopicKind::Unroutable);
        assert_eq!(scheme.classify("calc/method/a/b"), TopicKind::Unroutable);
        assert_eq!(scheme.classify("other/method/sum"), TopicKind::Unroutable);
        assert_eq!(scheme.classify("calc/status"), TopicKind::Unroutable);
    }

    #[test]
    fn namespaces_do_not_share_prefixes() {
        let a = TopicScheme::new("calc").unwrap();
        let b = TopicScheme::new("calc2").unwrap();
        let topic = b.call_topic("sum").unwrap();
        assert_eq!(a.classify(&topic), TopicKind::Unroutable);
    }
}
