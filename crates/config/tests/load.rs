use app_config::AppConfig;
use std::time::Duration;

#[test]
fn test_load_default_config() {
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.db_host, "localhost");
    assert_eq!(cfg.http_port, 8081);
    assert_eq!(cfg.otp_ttl, Duration::from_secs(30 * 60));
    assert_eq!(cfg.currency, "INR");
}
