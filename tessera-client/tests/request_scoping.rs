//! Property tests for outbound request scoping.

use proptest::prelude::*;
use tessera_client::{ClientScope, DefaultScoper, OutboundRequest, Scoper, Verb, CLUSTERS_PATH_PREFIX};
use tessera_core::Scope;
use tessera_test_utils::generators::{arb_name, arb_namespace, arb_scope, arb_scope_name};

fn arb_verb() -> impl Strategy<Value = Verb> {
    prop_oneof![
        Just(Verb::Get),
        Just(Verb::List),
        Just(Verb::Watch),
        Just(Verb::Create),
        Just(Verb::Update),
        Just(Verb::Delete),
    ]
}

proptest! {
    #[test]
    fn prop_scoped_request_carries_scope_in_path_and_header(
        scope in arb_scope(),
        verb in arb_verb(),
        ns in arb_namespace(),
        name in arb_name(),
    ) {
        let path = format!("/apis/example.dev/namespaces/{ns}/widgets/{name}");
        let mut request = OutboundRequest::new(verb, path.clone());
        let result = scope.scope_request(&mut request);

        if scope.is_wildcard() && !verb.is_read() {
            prop_assert!(result.unwrap_err().is_scope_misuse());
            prop_assert_eq!(&request.path, &path);
            prop_assert!(request.scope_header().is_none());
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(
                &request.path,
                &format!("{CLUSTERS_PATH_PREFIX}/{}{path}", scope.name())
            );
            prop_assert_eq!(request.scope_header(), Some(scope.name()));
        }
    }

    #[test]
    fn prop_cache_key_recovers_scope(scope in arb_scope_name(), ns in arb_namespace(), name in arb_name()) {
        let concrete = Scope::Concrete(scope);
        let key = ClientScope::cache_key(&concrete, &format!("{ns}/{name}")).unwrap();
        let recovered = DefaultScoper.scope_from_key(&key).unwrap();
        prop_assert_eq!(recovered, concrete);
    }
}
