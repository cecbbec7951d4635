use claimq::config::{Backend, Config};

#[test]
fn config_from_env_loads_fs_backend() {
    // Set required env vars for test
    unsafe {
        std::env::set_var("CLAIMQ_BACKEND", "fs");
        std::env::set_var("CLAIMQ_ITEMS_DIR", "/tmp/claimq-items");
        std::env::set_var("CLAIMQ_CLAIM_ATTEMPTS", "3");
    }

    let config = Config::from_env().unwrap();
    assert!(matches!(config.backend, Backend::Fs { .. }));
    assert_eq!(config.lease_policy().claim_attempts, 3);
    assert!(!config.log_level.is_empty());

    // Clean up
    unsafe {
        std::env::remove_var("CLAIMQ_BACKEND");
        std::env::remove_var("CLAIMQ_ITEMS_DIR");
        std::env::remove_var("CLAIMQ_CLAIM_ATTEMPTS");
    }
}

#[test]
fn config_from_lookup_fails_without_database_url() {
    let result = Config::from_lookup(|name| match name {
        "CLAIMQ_BACKEND" => Some("postgres".to_string()),
        _ => None,
    });
    assert!(result.is_err());
}
