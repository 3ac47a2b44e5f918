use std::sync::Mutex;
use std::time::Duration;

use chrono::{NaiveDate, Weekday};
use tempfile::NamedTempFile;

use motion_gate::config::MotionConfig;
use motion_gate::extension::{smtp, upload};
use motion_gate::MacAddress;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "MOTION_CONFIG",
        "MOTION_DEVICE_NAME",
        "MOTION_VIDEO_SOURCE",
        "MOTION_NOTIFICATION_DELAY_SECS",
        "MOTION_TRUSTED_MACS",
        "MOTION_SPOOL_DIR",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let file = write_config(
        r#"{
            "device_name": "Porch",
            "video_source": "stub://porch",
            "analyzer": "hash",
            "capture_delay_ms": 150,
            "notification_delay_secs": 10,
            "activation_check_secs": 30,
            "presence_check_secs": 90,
            "activation_periods": [[0, "08:00", "18:00"], [5, "00:00", "00:00"]],
            "mac_addresses": {"40:40:a7:92:f5:00": "phone"},
            "extensions": {
                "SmtpNotifier": {
                    "enabled": true,
                    "triggering_interval": 300,
                    "server": "smtp.example",
                    "port": 25,
                    "from": "camera@example",
                    "to": "owner@example"
                },
                "FtpUploader": {"enabled": false}
            }
        }"#,
    );
    std::env::set_var("MOTION_CONFIG", file.path());
    std::env::set_var("MOTION_DEVICE_NAME", "Back door");
    std::env::set_var("MOTION_SPOOL_DIR", "/var/spool/motion");

    let cfg = MotionConfig::load().expect("load config");

    assert_eq!(cfg.device_name, "Back door");
    assert_eq!(cfg.video_source, "stub://porch");
    assert_eq!(cfg.analyzer, "hash");
    assert_eq!(cfg.capture_delay, Duration::from_millis(150));
    assert_eq!(cfg.notification_delay, Duration::from_secs(10));
    assert_eq!(cfg.activation_check, Duration::from_secs(30));
    assert_eq!(cfg.presence_check, Duration::from_secs(90));
    assert_eq!(cfg.spool_dir, std::path::PathBuf::from("/var/spool/motion"));

    let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    assert!(cfg.schedule.is_activated(monday.and_hms_opt(8, 0, 0).unwrap()));
    assert!(!cfg.schedule.is_activated(monday.and_hms_opt(18, 1, 0).unwrap()));
    assert!(cfg.schedule.window(Weekday::Sat).unwrap().is_full_day());

    let phone = MacAddress::parse("40:40:A7:92:F5:00").unwrap();
    assert_eq!(cfg.trusted.label(&phone), Some("phone"));

    let mail = cfg.extension(smtp::KIND);
    assert!(mail.enabled);
    assert_eq!(mail.triggering_interval_secs, 300);
    assert_eq!(mail.endpoint(), Some(("smtp.example", 25)));
    assert_eq!(mail.get("to"), Some("owner@example"));
    assert!(!cfg.extension(upload::KIND).enabled);

    let settings = cfg.orchestrator_settings();
    assert_eq!(settings.capture.device_name, "Back door");
    assert_eq!(settings.activation_period, Duration::from_secs(30));

    clear_env();
}

#[test]
fn trusted_macs_from_env_replace_file_entries() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let file = write_config(r#"{"mac_addresses": {"40:40:A7:92:F5:00": "phone"}}"#);
    std::env::set_var("MOTION_CONFIG", file.path());
    std::env::set_var("MOTION_TRUSTED_MACS", "aa:bb:cc:dd:ee:ff, 11:22:33:44:55:66");
    std::env::set_var("MOTION_NOTIFICATION_DELAY_SECS", "0");

    let cfg = MotionConfig::load().expect("load config");
    assert_eq!(cfg.trusted.len(), 2);
    assert!(cfg.trusted.contains(&MacAddress::parse("AA:BB:CC:DD:EE:FF").unwrap()));
    assert!(!cfg.trusted.contains(&MacAddress::parse("40:40:A7:92:F5:00").unwrap()));
    assert_eq!(cfg.notification_delay, Duration::ZERO);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let cfg = MotionConfig::load().expect("load defaults");
    assert_eq!(cfg.device_name, "Camera 1");
    assert_eq!(cfg.video_source, "stub://camera");
    assert_eq!(cfg.analyzer, "difference");
    assert_eq!(cfg.notification_delay, Duration::from_secs(5));
    assert_eq!(cfg.activation_check, Duration::from_secs(60));
    assert_eq!(cfg.presence_check, Duration::from_secs(120));
    assert!(cfg.trusted.is_empty());
    assert!(cfg.spool_dir.ends_with("motion_gate"));
}

#[test]
fn invalid_values_are_rejected_at_load() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    for json in [
        r#"{"mac_addresses": {"40:40:A7:92:F5": "short"}}"#,
        r#"{"activation_periods": [[0, "18:00", "08:00"]]}"#,
        r#"{"activation_periods": [[1, "08:00", "09:00"], [1, "10:00", "11:00"]]}"#,
        r#"{"activation_periods": [[2, "8am", "09:00"]]}"#,
        r#"{"notification_delay_secs": 7200}"#,
        r#"{"presence_check_secs": 0}"#,
        r#"{"device_name": "   "}"#,
        r#"{"extensions": {"Pager": {"enabled": true}}}"#,
        r#"not json"#,
    ] {
        let file = write_config(json);
        std::env::set_var("MOTION_CONFIG", file.path());
        assert!(MotionConfig::load().is_err(), "accepted {json}");
    }

    clear_env();
    std::env::set_var("MOTION_NOTIFICATION_DELAY_SECS", "soon");
    assert!(MotionConfig::load().is_err());
    std::env::set_var("MOTION_NOTIFICATION_DELAY_SECS", "3601");
    assert!(MotionConfig::load().is_err());
    std::env::set_var("MOTION_TRUSTED_MACS", "zz:zz");
    std::env::remove_var("MOTION_NOTIFICATION_DELAY_SECS");
    assert!(MotionConfig::load().is_err());

    clear_env();
}
