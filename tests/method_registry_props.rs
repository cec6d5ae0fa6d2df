use proptest::prelude::*;
use pubsub_rpc::connection::methods::{MethodRegistry, SubscriptionChange, handler_fn};
use pubsub_rpc::{CorrelationId, TopicKind, TopicScheme};
use serde_json::Value;

#[derive(Debug, Clone)]
enum Op {
    Register(&'static str),
    Unregister(&'static str),
    Clear,
}

fn arb_method() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("sum"), Just("echo"), Just("ping"), Just("status")]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => arb_method().prop_map(Op::Register),
        3 => arb_method().prop_map(Op::Unregister),
        1 => Just(Op::Clear),
    ]
}

fn arb_segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.-]{0,11}"
}

proptest! {
    #[test]
    fn wildcard_is_held_iff_a_method_is_registered(ops in prop::collection::vec(arb_op(), 1..40)) {
        let scheme = TopicScheme::new("calc").unwrap();
        let wildcard = scheme.method_wildcard();
        let mut registry = MethodRegistry::new(scheme);
        let mut subscribed = false;

        for op in ops {
            let change = match op {
                Op::Register(method) => registry
                    .register(method, handler_fn(|_| async { Ok(Value::Null) }))
                    .unwrap(),
                Op::Unregister(method) => registry.unregister(method).unwrap(),
                Op::Clear => registry.clear(),
            };
            match change {
                SubscriptionChange::Subscribe(topic) => {
                    prop_assert!(!subscribed);
                    prop_assert_eq!(topic, wildcard.clone());
                    subscribed = true;
                }
                SubscriptionChange::Unsubscribe(topic) => {
                    prop_assert!(subscribed);
                    prop_assert_eq!(topic, wildcard.clone());
                    subscribed = false;
                }
                SubscriptionChange::Unchanged => {}
            }
            prop_assert_eq!(subscribed, !registry.is_empty());
            prop_assert_eq!(registry.methods().len(), registry.len());
        }
    }

    #[test]
    fn derived_topics_classify_back(namespace in arb_segment(), method in arb_segment()) {
        let scheme = TopicScheme::new(&namespace).unwrap();
        let call = scheme.call_topic(&method).unwrap();
        prop_assert_eq!(scheme.classify(&call), TopicKind::Call(method));

        let id = CorrelationId::generate();
        let response = scheme.response_topic(&id);
        prop_assert_eq!(scheme.classify(&response), TopicKind::Response(id.as_str().to_string()));
    }
}
