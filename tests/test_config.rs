use rkeatlas_backend::Config;

/// Создает тестовую конфигурацию
fn create_test_config() -> Config {
    Config {
        server_address: "0.0.0.0:8000".to_string(),
        database_url: "sqlite://data/rkeatlas.db".to_string(),
        encryption_key: "test-key".to_string(),
        log_level: "info".to_string(),
        playbook_dir: "/ansible/playbooks".to_string(),
        ansible_playbook_bin: "ansible-playbook".to_string(),
        kubectl_bin: "kubectl".to_string(),
        work_dir: "/tmp/rkeatlas".to_string(),
        join_port: 9345,
        cancel_grace_secs: 10,
        status_cache_ttl_secs: 300,
        analyzer_endpoint: None,
        analyzer_model: None,
    }
}

#[test]
fn test_config_load_succeeds_with_defaults() {
    // Все параметры имеют дефолты, загрузка не должна падать
    let config = Config::load().unwrap();
    assert!(!config.server_address.is_empty());
    assert!(!config.database_url.is_empty());
    assert!(config.join_port > 0);
}

#[test]
fn test_playbook_path_joins_cleanly() {
    let mut config = create_test_config();
    assert_eq!(
        config.playbook_path("install_rke2.yml"),
        "/ansible/playbooks/install_rke2.yml"
    );

    // Хвостовой слэш не ломает путь
    config.playbook_dir = "/ansible/playbooks/".to_string();
    assert_eq!(
        config.playbook_path("install_rke2.yml"),
        "/ansible/playbooks/install_rke2.yml"
    );
}

#[test]
fn test_analyzer_disabled_without_endpoint() {
    let mut config = create_test_config();
    assert!(!config.analyzer_enabled());

    config.analyzer_endpoint = Some("http://analyzer.local/v1/analyze".to_string());
    assert!(config.analyzer_enabled());
}
