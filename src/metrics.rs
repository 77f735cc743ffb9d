use prometheus::{GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone, Copy)]
pub enum Kind {
    GaugeVec,
    IntGaugeVec,
    IntCounterVec,
}

#[derive(Debug, Clone)]
pub struct MetricConfig<'a> {
    pub kind: Kind,
    pub name: &'a str,
    pub help: &'a str,
    pub label_names: &'a [&'a str],
}

pub type SharedRegistrar = Arc<Registrar>;

/// Prometheus registrar for the pool's lifecycle metrics. Metrics are
/// registered up front from [`MetricConfig`] descriptors and updated by name;
/// an update against an unregistered name is a no-op.
#[derive(Debug, Default)]
pub struct Registrar {
    registry: Registry,
    int_counter_vecs: RwLock<HashMap<String, IntCounterVec>>,
    int_gauge_vecs: RwLock<HashMap<String, IntGaugeVec>>,
    gauge_vecs: RwLock<HashMap<String, GaugeVec>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn with_metric_config(&self, metric: &MetricConfig<'_>) -> Result<(), Error> {
        log::debug!(
            "Registering metric {:?} with labels {:?}",
            metric.name,
            metric.label_names
        );

        let opts = Opts::new(metric.name, metric.help);

        let result = match metric.kind {
            Kind::GaugeVec => {
                let gauge = GaugeVec::new(opts, metric.label_names)?;
                let result = self.registry.register(Box::new(gauge.clone()));
                if result.is_ok() {
                    self.gauge_vecs
                        .write()
                        .expect("metric registry lock poisoned")
                        .insert(metric.name.to_string(), gauge);
                }
                result
            }
            Kind::IntGaugeVec => {
                let gauge = IntGaugeVec::new(opts, metric.label_names)?;
                let result = self.registry.register(Box::new(gauge.clone()));
                if result.is_ok() {
                    self.int_gauge_vecs
                        .write()
                        .expect("metric registry lock poisoned")
                        .insert(metric.name.to_string(), gauge);
                }
                result
            }
            Kind::IntCounterVec => {
                let counter = IntCounterVec::new(opts, metric.label_names)?;
                let result = self.registry.register(Box::new(counter.clone()));
                if result.is_ok() {
                    self.int_counter_vecs
                        .write()
                        .expect("metric registry lock poisoned")
                        .insert(metric.name.to_string(), counter);
                }
                result
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(prometheus::Error::AlreadyReg) => {
                log::debug!("Metric {:?} is already registered", metric.name);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to register metric {:?}: {e:?}", metric.name);
                Err(Error::Prometheus(e))
            }
        }
    }

    pub fn with_metric_configs(&self, metrics: &[MetricConfig<'_>]) -> Result<(), Error> {
        for metric in metrics {
            self.with_metric_config(metric)?;
        }
        Ok(())
    }

    pub fn inc_int_counter_vec(&self, key: &str, labels: &[&str]) {
        let counters = self
            .int_counter_vecs
            .read()
            .expect("metric registry lock poisoned");

        if let Some(counter) = counters.get(key) {
            counter.with_label_values(labels).inc();
        }
    }

    pub fn set_int_gauge_vec(&self, key: &str, labels: &[&str], value: i64) {
        let gauges = self
            .int_gauge_vecs
            .read()
            .expect("metric registry lock poisoned");

        if let Some(gauge) = gauges.get(key) {
            gauge.with_label_values(labels).set(value);
        }
    }

    pub fn set_gauge_vec(&self, key: &str, labels: &[&str], value: f64) {
        let gauges = self
            .gauge_vecs
            .read()
            .expect("metric registry lock poisoned");

        if let Some(gauge) = gauges.get(key) {
            gauge.with_label_values(labels).set(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_config() -> MetricConfig<'static> {
        MetricConfig {
            kind: Kind::IntCounterVec,
            name: "test_events_total",
            help: "Total test events",
            label_names: &["status"],
        }
    }

    #[test]
    fn registers_and_increments_counter() {
        let registrar = Registrar::new();
        registrar.with_metric_config(&counter_config()).unwrap();

        registrar.inc_int_counter_vec("test_events_total", &["success"]);
        registrar.inc_int_counter_vec("test_events_total", &["success"]);

        let families = registrar.registry().gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "test_events_total")
            .unwrap();
        assert_eq!(family.get_metric()[0].get_counter().get_value() as u64, 2);
    }

    #[test]
    fn re_registration_is_not_an_error() {
        let registrar = Registrar::new();
        registrar.with_metric_config(&counter_config()).unwrap();
        registrar.with_metric_config(&counter_config()).unwrap();
    }

    #[test]
    fn updates_against_unregistered_names_are_ignored() {
        let registrar = Registrar::new();
        registrar.inc_int_counter_vec("missing", &["x"]);
        registrar.set_gauge_vec("missing", &["x"], 1.0);
        registrar.set_int_gauge_vec("missing", &["x"], 1);
    }
}
