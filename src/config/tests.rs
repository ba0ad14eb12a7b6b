use super::*;

#[test]
fn test_tool_source_seed_parses_camel_case() {
    let raw = r#"[
        {
            "type": "openapi",
            "name": "github",
            "config": {"url": "https://api.github.com/openapi.json"},
            "workspaceId": "ws-1"
        },
        {
            "type": "mcp",
            "name": "notes",
            "config": {"url": "http://localhost:9000/mcp"},
            "enabled": false
        }
    ]"#;
    let seeds: Vec<ToolSourceSeed> = serde_json::from_str(raw).unwrap();
    assert_eq!(seeds.len(), 2);
    assert_eq!(seeds[0].kind, SourceKind::Openapi);
    assert_eq!(seeds[0].workspace_id.as_deref(), Some("ws-1"));
    assert!(seeds[0].enabled);
    assert_eq!(seeds[1].kind, SourceKind::Mcp);
    assert!(!seeds[1].enabled);
}

#[test]
fn test_env_flag_semantics() {
    // Unset: default wins.
    assert!(env_flag("CODEPLANE_TEST_FLAG_UNSET", true));
    assert!(!env_flag("CODEPLANE_TEST_FLAG_UNSET", false));
}

#[test]
fn test_default_config_is_self_consistent() {
    let config = Config::default();
    assert_eq!(config.port, 3011);
    assert!(config.internal_base_url.ends_with(":3011"));
    assert!(!config.internal_token.is_empty());
    assert!(config.server_auto_execute);
    assert!(config.tool_sources.is_empty());
}
