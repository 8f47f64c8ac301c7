/// Verify that all modules are accessible from the crate root.
/// Each `use` statement will cause a compile error if the module is missing.

#[allow(unused_imports)]
use guardian_client::auth;
#[allow(unused_imports)]
use guardian_client::cli;
#[allow(unused_imports)]
use guardian_client::client;
#[allow(unused_imports)]
use guardian_client::config;
#[allow(unused_imports)]
use guardian_client::error;
#[allow(unused_imports)]
use guardian_client::probe;
#[allow(unused_imports)]
use guardian_client::recorder;
#[allow(unused_imports)]
use guardian_client::reporter;
#[allow(unused_imports)]
use guardian_client::session;
#[allow(unused_imports)]
use guardian_client::store;

#[test]
fn all_modules_are_accessible() {
    // store should also expose the REST implementation.
    let _ = std::any::type_name::<store::rest::RestStore>();
}

#[test]
fn cargo_toml_defines_guardian_client_binary() {
    let cargo_toml = std::fs::read_to_string("Cargo.toml").expect("Failed to read Cargo.toml");
    assert!(
        cargo_toml.contains("name = \"guardian-client\""),
        "Cargo.toml should define guardian-client binary"
    );
    assert!(
        cargo_toml.contains("path = \"src/main.rs\""),
        "Cargo.toml should specify path for guardian-client binary"
    );
}
