//! Occupancy display updater
//!
//! Periodically reads the per-space sensors, asks central for the
//! facility-wide free count and writes it to the display register. When
//! central is unreachable the display shows the sensor-derived count instead.

use crate::infra::metrics::Metrics;
use crate::io::bus::BusClient;
use crate::io::modbus::{BusFault, REG_DISPLAY, REG_SPACE_SENSORS, SPACE_SENSOR_COUNT};
use crate::io::transport::CentralLink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplaySource {
    Central,
    Sensors,
}

impl DisplaySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplaySource::Central => "central",
            DisplaySource::Sensors => "sensors",
        }
    }
}

pub struct DisplayUpdater {
    bus: Arc<dyn BusClient>,
    central: Arc<dyn CentralLink>,
    interval: Duration,
    last_written: Option<u16>,
    metrics: Arc<Metrics>,
}

impl DisplayUpdater {
    pub fn new(bus: Arc<dyn BusClient>, central: Arc<dyn CentralLink>, interval: Duration, metrics: Arc<Metrics>) -> Self {
        Self { bus, central, interval, last_written: None, metrics }
    }

    /// Value currently on the display, if any was written
    pub fn shown(&self) -> Option<u16> {
        self.last_written
    }

    /// One refresh cycle. The sensors are only read when central is
    /// unreachable, and the register is only written when the value changes.
    pub async fn refresh(&mut self) -> Result<(u16, DisplaySource), BusFault> {
        let (free, source) = match self.central.statistics().await {
            Ok(stats) => (stats.free, DisplaySource::Central),
            Err(e) => {
                debug!(error = %e, "display_central_unavailable");
                let values = self
                    .bus
                    .read_input_registers(REG_SPACE_SENSORS, SPACE_SENSOR_COUNT)
                    .await
                    .inspect_err(|e| warn!(error = %e, "display_sensor_read_failed"))?;
                let free = values.iter().filter(|&&v| v == 0).count() as u32;
                (free, DisplaySource::Sensors)
            }
        };

        let value = u16::try_from(free).unwrap_or(u16::MAX);
        if self.last_written != Some(value) {
            self.bus.write_holding_register(REG_DISPLAY, value).await?;
            self.last_written = Some(value);
            self.metrics.record_display_update();
            info!(free = value, source = source.as_str(), "display_updated");
        }
        Ok((value, source))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "display_updater_started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "display_refresh_failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("display_updater_stopped");
    }
}
