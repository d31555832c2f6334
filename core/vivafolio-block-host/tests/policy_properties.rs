//! Property-based tests for the dependency policy.
//!
//! These verify properties that must hold for any specifier:
//! - Anything outside the allowlist is blocked, before any local module runs
//! - Relative specifiers always go to the local module cache
//! - Allowlisted specifiers are never blocked

mod common;

use common::*;
use proptest::prelude::*;
use serde_json::json;
use vivafolio_block_host::*;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn package_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("(@[a-z]{1,8}/)?[a-z][a-z0-9-]{0,15}")
        .unwrap()
        .prop_filter("host module specifiers are allowlisted", |s| {
            !HostModule::ALL.iter().any(|m| m.default_specifier() == s)
        })
}

fn relative_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("(\\./|\\.\\./)[a-z]{1,10}\\.(js|css|wat)").unwrap()
}

// =============================================================================
// ALLOWLIST PROPERTIES
// =============================================================================

mod allowlist_properties {
    use super::*;

    proptest! {
        /// Non-relative specifiers missing from the default allowlist are blocked
        #[test]
        fn unknown_packages_are_blocked(specifier in package_strategy()) {
            let allowlist = DependencyAllowlist::default();
            prop_assert_eq!(allowlist.classify(&specifier), SpecifierClass::Blocked);
            prop_assert!(!allowlist.is_allowed(&specifier));
        }

        /// Relative specifiers bypass the allowlist entirely
        #[test]
        fn relative_specifiers_are_local(specifier in relative_strategy()) {
            let allowlist = DependencyAllowlist::new(Vec::<String>::new());
            prop_assert_eq!(allowlist.classify(&specifier), SpecifierClass::Relative);
        }

        /// Adding a specifier to the allowlist means it is never blocked
        #[test]
        fn allowlisted_packages_are_not_blocked(specifier in package_strategy()) {
            let allowlist = DependencyAllowlist::new([specifier.clone()]);
            prop_assert_ne!(allowlist.classify(&specifier), SpecifierClass::Blocked);
        }
    }
}

// =============================================================================
// LOADER PROPERTIES
// =============================================================================

mod loader_properties {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// A bundle importing a non-allowlisted package fails to load, reports
        /// the package, and leaves its local modules unexecuted
        #[test]
        fn blocked_import_prevents_evaluation(specifier in package_strategy()) {
            let h = Harness::new();
            let bundle = format!(
                r#"(module
                  (import "./util.wat" "helper" (func (result i32)))
                  (import "{specifier}" "f" (func))
                  (func (export "render") (result i32) (i32.const -1)))"#
            );
            let resources = h.publish("prop", &[("main.js", bundle.as_str()), ("util.wat", UTIL_MODULE)]);
            let mut loader = h.loader();

            let err = loader
                .load_block(&notification("b1", graph(&[("e1", json!({}))]), resources))
                .unwrap_err();

            prop_assert!(err.is_blocked_dependency());
            let diagnostics = loader.get_diagnostics().unwrap();
            prop_assert_eq!(&diagnostics.blocked_dependencies, &vec![specifier]);
            prop_assert!(!diagnostics.local_module("util.wat").unwrap().executed);
            prop_assert!(!loader.is_loaded());
        }
    }
}
