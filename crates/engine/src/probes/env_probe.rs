//! Environment-variable snapshot probe. Not polled: the sensor bus
//! re-checks it synchronously on every triggered evaluation.

use super::Probe;
use async_trait::async_trait;
use overseer_core::{sensor_names, Clock, SensorReading};

pub struct EnvProbe<C: Clock> {
    var: String,
    sensor: String,
    clock: C,
}

impl<C: Clock> EnvProbe<C> {
    pub fn new(var: impl Into<String>, clock: C) -> Self {
        let var = var.into();
        let sensor = sensor_names::env(&var);
        Self { var, sensor, clock }
    }
}

#[async_trait]
impl<C: Clock> Probe for EnvProbe<C> {
    fn name(&self) -> &str {
        &self.sensor
    }

    async fn check(&self) -> SensorReading {
        match std::env::var(&self.var) {
            Ok(value) => SensorReading::text(&self.sensor, value, self.clock.now()),
            Err(_) => SensorReading::error(&self.sensor, "unset", self.clock.now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::FakeClock;

    #[tokio::test]
    async fn reads_a_set_variable() {
        std::env::set_var("OVERSEER_TEST_ENV_PROBE", "value");
        let probe = EnvProbe::new("OVERSEER_TEST_ENV_PROBE", FakeClock::new());
        let reading = probe.check().await;
        assert_eq!(reading.value.as_deref(), Some("value"));
        std::env::remove_var("OVERSEER_TEST_ENV_PROBE");
    }

    #[tokio::test]
    async fn unset_variable_becomes_an_error_reading() {
        std::env::remove_var("OVERSEER_TEST_ENV_PROBE_UNSET");
        let probe = EnvProbe::new("OVERSEER_TEST_ENV_PROBE_UNSET", FakeClock::new());
        let reading = probe.check().await;
        assert!(reading.is_error());
    }
}
