use nova_config::ConfigLoader;
use nova_logging::LogFormat;
use nova_metrics::{Aggregation, Comparator, Condition, NotifierConfig, Severity};
use std::path::PathBuf;
use std::time::Duration;

fn sample_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/nova.toml")
}

#[test]
fn sample_config_loads_and_compiles() {
    let config = ConfigLoader::new(sample_config())
        .with_env_prefix("NOVA_IT_SAMPLE")
        .load()
        .unwrap();

    assert_eq!(config.server.port, 9090);
    assert_eq!(config.logging.format, LogFormat::Text);
    assert_eq!(config.ingest.max_future_skew, Duration::from_secs(300));
    assert_eq!(config.series.capacity_classes.len(), 1);
    assert_eq!(config.series.capacity_classes[0].capacity, 300);
    assert_eq!(config.series.series_ttl, Duration::from_secs(24 * 3600));
    assert_eq!(config.evaluator.grace(), Duration::from_secs(30));
    assert_eq!(config.alerts.history_ttl, Duration::from_secs(7 * 24 * 3600));
    assert_eq!(config.notifiers, vec![NotifierConfig::Log]);

    let rules = config.compile_rules().unwrap();
    assert_eq!(rules.len(), 3);

    let cpu = &rules[0];
    assert_eq!(cpu.id(), "cpu-high");
    assert_eq!(cpu.severity(), Severity::Critical);
    assert_eq!(cpu.duration(), Duration::from_secs(120));
    assert_eq!(
        cpu.condition(),
        Condition::Threshold {
            aggregation: Aggregation::Mean,
            window: Duration::from_secs(60),
        }
    );

    assert_eq!(rules[1].comparator(), Comparator::GreaterEqual);
    assert_eq!(
        rules[2].condition(),
        Condition::RateOfChange {
            window: Duration::from_secs(300),
        }
    );
}

#[test]
fn monitor_builds_from_sample_config() {
    let config = ConfigLoader::new(sample_config())
        .with_env_prefix("NOVA_IT_MONITOR")
        .load()
        .unwrap();

    let rules = config.compile_rules().unwrap();
    let monitor = nova_metrics::Monitor::with_system_clock(config.monitor_config(), rules).unwrap();
    assert_eq!(monitor.store().capacity_for("cpu.usage"), 300);
    assert_eq!(monitor.store().capacity_for("mem.used"), 1000);
    assert_eq!(monitor.evaluator().rules().len(), 3);
}
