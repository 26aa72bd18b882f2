// Copyright (C) 2025 Matías Salinas (support@fenden.com)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[cfg(test)]
pub mod tests {
    use poolgate::config::Config;
    use std::env;
    use std::fs::write;

    fn temp_config_path(filename: &str) -> String {
        let dir = env::temp_dir();
        dir.join(filename).to_string_lossy().to_string()
    }

    #[test]
    fn test_load_valid_config_from_file() {
        let yaml = r#"
app_id: testapp
max_account_switches: 4
concurrency:
  ping_interval_seconds: 10
  slot_wait_timeout_seconds: 45
gateway:
  body_max_bytes: 4096
  default_instructions: "be concise"
upstream:
  connect_timeout_secs: 5
  read_timeout_secs: 60
proxy_port: 4000
admin_port: 4001
recorder_timeout_secs: 7
"#;

        let path = temp_config_path("test_config_valid.yaml");
        write(&path, yaml).unwrap();
        let config = Config::from_file(&path).expect("should parse valid config");

        assert_eq!(config.app_id, "testapp");
        assert_eq!(config.max_account_switches, 4);
        assert_eq!(config.concurrency.ping_interval_seconds, 10);
        assert_eq!(config.concurrency.slot_wait_timeout_seconds, 45);
        assert_eq!(config.gateway.body_max_bytes, 4096);
        assert_eq!(config.gateway.default_instructions, "be concise");
        assert_eq!(config.upstream.connect_timeout_secs, 5);
        assert_eq!(config.upstream.read_timeout_secs, 60);
        assert_eq!(config.proxy_port, 4000);
        assert_eq!(config.admin_port, 4001);
        assert_eq!(config.recorder_timeout_secs, 7);
    }

    #[test]
    fn test_header_whitelist_defaults_when_omitted() {
        let yaml = "app_id: testapp\n";
        let path = temp_config_path("test_config_whitelist.yaml");
        write(&path, yaml).unwrap();
        let config = Config::from_file(&path).unwrap();

        assert!(config.header_whitelist.contains(&"authorization".to_string()));
        assert!(!config.header_whitelist.is_empty());
    }

    #[test]
    fn test_header_whitelist_override() {
        let yaml = "app_id: testapp\nheader_whitelist:\n  - x-request-id\n  - x-session-id\n";
        let path = temp_config_path("test_config_whitelist_override.yaml");
        write(&path, yaml).unwrap();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.header_whitelist, vec!["x-request-id", "x-session-id"]);
    }

    #[test]
    fn test_default_matches_from_file_with_only_app_id() {
        let yaml = "app_id: poolgate\n";
        let path = temp_config_path("test_config_default_equiv.yaml");
        write(&path, yaml).unwrap();
        let from_file = Config::from_file(&path).unwrap();
        let default = Config::default();

        assert_eq!(from_file.app_id, default.app_id);
        assert_eq!(from_file.max_account_switches, default.max_account_switches);
        assert_eq!(from_file.proxy_port, default.proxy_port);
        assert_eq!(from_file.admin_port, default.admin_port);
    }

    #[test]
    fn test_nonexistent_file_fails() {
        let result = Config::from_file("nonexistent.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_yaml_fails() {
        let malformed = "app_id: test\n  - invalid_yaml";
        let path = temp_config_path("test_config_bad.yaml");
        write(&path, malformed).unwrap();
        let result = Config::from_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn test_slot_wait_timeout_zero_rejected() {
        let yaml = "app_id: testapp\nconcurrency:\n  slot_wait_timeout_seconds: 0\n";
        let path = temp_config_path("test_config_zero_wait.yaml");
        write(&path, yaml).unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_empty_app_id_is_rejected() {
        let yaml = "app_id: \"\"\n";
        let path = temp_config_path("test_config_empty_app_id.yaml");
        write(&path, yaml).unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_zero_body_max_bytes_is_rejected() {
        let yaml = "app_id: x\ngateway:\n  body_max_bytes: 0\n";
        let path = temp_config_path("test_config_zero_body.yaml");
        write(&path, yaml).unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
