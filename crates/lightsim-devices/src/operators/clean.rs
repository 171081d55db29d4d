/*!
 * Clean (HEV) cycles.
 *
 * A running cycle is tracked outside the attribute tree because its remaining
 * time is read from the clock. A timer task in the device's task group ends
 * the cycle with `success`. Losing power ends it early with
 * `interrupted_by_reset`.
 */
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use lightsim_core::config::CleanConfig;
use lightsim_core::types::{Record, Value};

use crate::attrs::Path;
use crate::device::Device;
use crate::error::{DeviceError, RespondError, Result};
use crate::event::{Event, EventType};
use crate::plugin::Operator;
use crate::protocol::{HevCycleResult, Message, MessageKind};

/// Registry name
pub const NAME: &str = "clean";

/// Options read from the value store
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanOptions {
    /// Whether the light flashes when a cycle ends
    #[serde(default)]
    pub clean_indication: bool,

    /// Cycle length used for a request of zero seconds
    #[serde(default)]
    pub clean_default_duration_s: Option<u32>,
}

#[derive(Debug)]
struct Cycle {
    generation: u64,
    started: Instant,
    duration: Duration,
    timer: AbortHandle,
}

type CycleSlot = Arc<Mutex<Option<Cycle>>>;

fn detail(key: &str) -> Path {
    Path::root("clean_details").key(key)
}

fn ended(result: HevCycleResult) -> Vec<(Path, Value)> {
    vec![
        (detail("enabled"), Value::from(false)),
        (detail("duration_s"), Value::from(0u32)),
        (detail("last_result"), Value::from(result.as_str())),
    ]
}

/// Owns the `clean_details` attribute and the running cycle
#[derive(Debug)]
pub struct CleanOperator {
    indication: bool,
    default_duration_s: u32,
    max_duration_s: u32,
    cycle: CycleSlot,
    generation: AtomicU64,
}

impl CleanOperator {
    /// Create the operator, checking the default cycle length against the limit
    pub fn new(options: CleanOptions, config: &CleanConfig) -> Result<Self> {
        let default_duration_s = options
            .clean_default_duration_s
            .unwrap_or(config.default_duration_s);
        if default_duration_s == 0 || default_duration_s > config.max_duration_s {
            return Err(DeviceError::invalid_options(
                NAME,
                format!(
                    "default duration {}s must be between 1 and {}",
                    default_duration_s, config.max_duration_s
                ),
            ));
        }
        Ok(Self {
            indication: options.clean_indication,
            default_duration_s,
            max_duration_s: config.max_duration_s,
            cycle: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        })
    }

    fn take_cycle(&self) -> Option<Cycle> {
        self.cycle.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn remaining(&self) -> Duration {
        self.cycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.duration.saturating_sub(c.started.elapsed()))
            .unwrap_or_default()
    }

    fn duration_for(&self, device: &Device, requested: u32) -> u32 {
        let requested = if requested == 0 {
            device
                .attrs()
                .int(detail("default_duration_s"))
                .map(|d| d as u32)
                .unwrap_or(self.default_duration_s)
        } else {
            requested
        };
        requested.min(self.max_duration_s)
    }

    async fn start(&self, device: &Arc<Device>, event: &Event, requested: u32) -> Result<()> {
        let duration_s = self.duration_for(device, requested);
        let last_power = device.attrs().int("power").unwrap_or(0) > 0;
        if let Some(previous) = self.take_cycle() {
            previous.timer.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let duration = Duration::from_secs(duration_s as u64);
        let timer = device.spawn_task(
            format!("clean cycle {}", generation),
            finish_after(
                Arc::downgrade(device),
                Arc::clone(&self.cycle),
                generation,
                duration,
            ),
        );
        *self.cycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(Cycle {
            generation,
            started: Instant::now(),
            duration,
            timer,
        });
        info!("{} started a {}s clean cycle", device.serial(), duration_s);

        device
            .change(
                vec![
                    (detail("enabled"), Value::from(true)),
                    (detail("duration_s"), Value::from(duration_s)),
                    (detail("last_power"), Value::from(last_power)),
                ],
                Some(event.clone()),
            )
            .await?;
        Ok(())
    }

    async fn interrupt(&self, device: &Arc<Device>, event: &Event, result: HevCycleResult) -> Result<()> {
        let Some(cycle) = self.take_cycle() else {
            return Ok(());
        };
        cycle.timer.abort();
        info!("{} clean cycle ended: {}", device.serial(), result.as_str());
        device.change(ended(result), Some(event.clone())).await?;
        Ok(())
    }
}

async fn finish_after(
    device: Weak<Device>,
    cycle: CycleSlot,
    generation: u64,
    duration: Duration,
) -> Result<()> {
    tokio::time::sleep(duration).await;

    let finished = {
        let mut slot = cycle.lock().unwrap_or_else(|e| e.into_inner());
        let current = slot.as_ref().map(|c| c.generation) == Some(generation);
        if current {
            slot.take();
        }
        current
    };
    if !finished {
        return Ok(());
    }
    let Some(device) = device.upgrade() else {
        return Ok(());
    };
    debug!("{} clean cycle {} finished", device.serial(), generation);
    device.change(ended(HevCycleResult::Success), None).await?;
    Ok(())
}

#[async_trait]
impl Operator for CleanOperator {
    fn name(&self) -> &str {
        NAME
    }

    async fn reset(&self, device: &Arc<Device>, event: &Event, zerod: bool) -> Result<()> {
        if let Some(cycle) = self.take_cycle() {
            cycle.timer.abort();
        }

        let last_result = if zerod {
            None
        } else {
            device.attrs().string(detail("last_result"))
        };
        let indication = !zerod && self.indication;
        let default_duration_s = if zerod { 0 } else { self.default_duration_s };
        let details = Record::new()
            .with("enabled", false)
            .with("duration_s", 0u32)
            .with("last_power", false)
            .with("indication", indication)
            .with("default_duration_s", default_duration_s)
            .with(
                "last_result",
                last_result.unwrap_or_else(|| HevCycleResult::None.as_str().to_string()),
            );
        device
            .apply(
                vec![Path::root("clean_details").change_to(details)],
                Some(event.clone()),
            )
            .await?;
        Ok(())
    }

    async fn respond(
        &self,
        device: &Arc<Device>,
        event: &Event,
    ) -> std::result::Result<(), RespondError> {
        if event.matches(EventType::PowerOff) {
            self.interrupt(device, event, HevCycleResult::InterruptedByReset)
                .await?;
            return Ok(());
        }
        if event.matches(EventType::Delete) {
            if let Some(cycle) = self.take_cycle() {
                cycle.timer.abort();
            }
            return Ok(());
        }

        let Some(message) = event.incoming() else {
            return Ok(());
        };
        let kind = match message {
            Message::GetHevCycle => MessageKind::StateHevCycle,
            Message::SetHevCycle {
                enable: true,
                duration_s,
            } => {
                self.start(device, event, *duration_s).await?;
                MessageKind::StateHevCycle
            }
            Message::SetHevCycle { enable: false, .. } => {
                self.interrupt(device, event, HevCycleResult::InterruptedByLan)
                    .await?;
                MessageKind::StateHevCycle
            }
            Message::GetHevCycleConfiguration => MessageKind::StateHevCycleConfiguration,
            Message::SetHevCycleConfiguration {
                indication,
                duration_s,
            } => {
                let duration_s = if *duration_s == 0 {
                    self.default_duration_s
                } else {
                    (*duration_s).min(self.max_duration_s)
                };
                device
                    .change(
                        vec![
                            (detail("indication"), Value::from(*indication)),
                            (detail("default_duration_s"), Value::from(duration_s)),
                        ],
                        Some(event.clone()),
                    )
                    .await?;
                MessageKind::StateHevCycleConfiguration
            }
            Message::GetLastHevCycleResult => MessageKind::StateLastHevCycleResult,
            _ => return Ok(()),
        };
        event.add_replies(self.state_for(device, kind));
        Ok(())
    }

    fn state_for(&self, device: &Device, kind: MessageKind) -> Vec<Message> {
        let attrs = device.attrs();
        match kind {
            MessageKind::StateHevCycle => vec![Message::StateHevCycle {
                duration_s: attrs.int(detail("duration_s")).unwrap_or(0) as u32,
                remaining_s: self.remaining().as_secs() as u32,
                last_power: attrs.bool(detail("last_power")).unwrap_or(false),
            }],
            MessageKind::StateHevCycleConfiguration => vec![Message::StateHevCycleConfiguration {
                indication: attrs.bool(detail("indication")).unwrap_or(false),
                duration_s: attrs.int(detail("default_duration_s")).unwrap_or(0) as u32,
            }],
            MessageKind::StateLastHevCycleResult => vec![Message::StateLastHevCycleResult {
                result: attrs
                    .string(detail("last_result"))
                    .map(|r| HevCycleResult::parse(&r))
                    .unwrap_or_default(),
            }],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use lightsim_core::config::Config;

    use super::*;
    use crate::event::EventKind;
    use crate::operators::testing::ask;
    use crate::plugin::Plugin;
    use crate::product::{Firmware, Product};
    use crate::viewers::Recorder;

    async fn clean_bulb(recorder: &Arc<Recorder>) -> Arc<Device> {
        let mut config = Config::default();
        config.clean.max_duration_s = 3600;
        let device = Device::builder("d073d5000001".parse().unwrap(), Product::LCM3_A19_CLEAN, Firmware::new(3, 90, 0))
            .config(config)
            .value("power", 65535)
            .value("clean_default_duration_s", 600)
            .plugin(Plugin::Viewer(recorder.clone()))
            .build();
        device.reset(false).await.unwrap();
        device
    }

    fn hev_state(device: &Device) -> Message {
        device.state_for(MessageKind::StateHevCycle).unwrap()
    }

    fn last_result(device: &Device) -> Message {
        device.state_for(MessageKind::StateLastHevCycleResult).unwrap()
    }

    #[test]
    fn test_default_duration_must_fit_the_limit() {
        let config = CleanConfig {
            default_duration_s: 7200,
            max_duration_s: 3600,
        };
        assert!(matches!(
            CleanOperator::new(CleanOptions::default(), &config),
            Err(DeviceError::InvalidOptions { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_cycle_interrupts_running_clean() {
        let recorder = Arc::new(Recorder::new());
        let device = clean_bulb(&recorder).await;

        let (_, replies) = ask(&device, Message::SetHevCycle { enable: true, duration_s: 60 }).await;
        assert_eq!(
            replies,
            vec![Message::StateHevCycle {
                duration_s: 60,
                remaining_s: 60,
                last_power: true,
            }]
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            hev_state(&device),
            Message::StateHevCycle {
                duration_s: 60,
                remaining_s: 50,
                last_power: true,
            }
        );

        device.power_off().await.unwrap();
        device.power_on().await.unwrap();

        assert_eq!(
            hev_state(&device),
            Message::StateHevCycle {
                duration_s: 0,
                remaining_s: 0,
                last_power: true,
            }
        );
        assert_eq!(
            last_result(&device),
            Message::StateLastHevCycleResult {
                result: HevCycleResult::InterruptedByReset
            }
        );

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            last_result(&device),
            Message::StateLastHevCycleResult {
                result: HevCycleResult::InterruptedByReset
            }
        );

        device.reset(false).await.unwrap();
        assert_eq!(
            last_result(&device),
            Message::StateLastHevCycleResult {
                result: HevCycleResult::InterruptedByReset
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_runs_to_completion() {
        let recorder = Arc::new(Recorder::new());
        let device = clean_bulb(&recorder).await;

        ask(&device, Message::SetHevCycle { enable: true, duration_s: 60 }).await;
        recorder
            .wait_for(
                |e: &Event| match &e.kind {
                    EventKind::AttributeChange { changes, because, .. } => {
                        because.is_none()
                            && changes
                                .iter()
                                .any(|c| c.path().to_string() == "clean_details.last_result")
                    }
                    _ => false,
                },
                Duration::from_secs(120),
            )
            .await
            .unwrap();

        assert_eq!(
            last_result(&device),
            Message::StateLastHevCycleResult {
                result: HevCycleResult::Success
            }
        );
        assert_eq!(
            hev_state(&device),
            Message::StateHevCycle {
                duration_s: 0,
                remaining_s: 0,
                last_power: true,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_durations_and_configuration() {
        let recorder = Arc::new(Recorder::new());
        let device = clean_bulb(&recorder).await;

        let (_, replies) = ask(&device, Message::SetHevCycle { enable: true, duration_s: 0 }).await;
        assert_eq!(
            replies,
            vec![Message::StateHevCycle {
                duration_s: 600,
                remaining_s: 600,
                last_power: true,
            }]
        );

        let (_, replies) = ask(&device, Message::SetHevCycle { enable: true, duration_s: 100_000 }).await;
        assert!(matches!(
            replies[0],
            Message::StateHevCycle { duration_s: 3600, .. }
        ));

        ask(&device, Message::SetHevCycle { enable: false, duration_s: 0 }).await;
        assert_eq!(
            last_result(&device),
            Message::StateLastHevCycleResult {
                result: HevCycleResult::InterruptedByLan
            }
        );

        let (_, replies) = ask(
            &device,
            Message::SetHevCycleConfiguration {
                indication: true,
                duration_s: 900,
            },
        )
        .await;
        assert_eq!(
            replies,
            vec![Message::StateHevCycleConfiguration {
                indication: true,
                duration_s: 900,
            }]
        );
        let (_, replies) = ask(&device, Message::SetHevCycle { enable: true, duration_s: 0 }).await;
        assert!(matches!(
            replies[0],
            Message::StateHevCycle { duration_s: 900, .. }
        ));
    }
}
