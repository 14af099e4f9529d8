//! Picks the best transport tier the local graphics stack supports.
//!
//! Tiers are tried best first, starting at the ceiling. Each probe makes real
//! allocations and frees them again before the next probe, so whatever wins
//! is known to work at the surface's size. The walk cannot fail: the
//! CPU-mediated tier needs nothing beyond a renderable framebuffer.
//!
//! Within the interop tier the render target's depth/stencil requirements are
//! relaxed rung by rung (see [`SurfaceConfig::LADDER`]), and on every rung the
//! shared resource is tried as a texture before a renderbuffer.

use crate::config::TransportConfig;
use crate::render::{with_current_context, DeviceError, GraphicsDevice, SyncMode};
use crate::surface::{ChannelOrder, Origin, SurfaceConfig, SurfaceId, SurfaceSize};
use crate::transport::bridge::{FrameTransportBridge, SharedTarget};
use crate::transport::factory::probe_render_target;
use crate::transport::fallback::FallbackCopyPath;
use crate::transport::handle::FrameSlot;
use crate::transport::interop::InteropTarget;
use crate::transport::native::NativeTarget;
use crate::transport::strategy::{Providers, TransportStrategy};
use crate::transport::{AttemptOutcome, InteropAttachment, NegotiationAttempt, Tier, TransportCapability};
use std::sync::Arc;
use std::time::Duration;

/// Result of a negotiation.
pub struct Negotiated {
    pub capability: TransportCapability,
    /// Configuration the render target must be built with.
    pub surface_config: SurfaceConfig,
    pub strategy: Box<dyn TransportStrategy>,
    pub attempts: Vec<NegotiationAttempt>,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("capability", &self.capability)
            .field("surface_config", &self.surface_config)
            .field("attempts", &self.attempts.len())
            .finish()
    }
}

type Winner = (TransportCapability, SurfaceConfig, Box<dyn TransportStrategy>);

pub struct CapabilityNegotiator {
    surface_id: SurfaceId,
    max_tier: Tier,
    ceiling: Tier,
    start: SurfaceConfig,
    sync_mode: SyncMode,
    sync_timeout: Duration,
    host_order: ChannelOrder,
    host_origin: Origin,
    slot: Arc<FrameSlot>,
}

impl CapabilityNegotiator {
    pub(crate) fn new(surface_id: SurfaceId, config: &TransportConfig, slot: Arc<FrameSlot>) -> Self {
        Self {
            surface_id,
            max_tier: config.max_tier,
            ceiling: Tier::NativeSharedMemory,
            start: SurfaceConfig::D24S8,
            sync_mode: config.sync_mode,
            sync_timeout: config.sync_timeout(),
            host_order: config.host_channel_order,
            host_origin: config.host_origin,
            slot,
        }
    }

    /// Skips every tier better than `ceiling`.
    pub fn with_ceiling(mut self, ceiling: Tier) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Starts the relaxation ladder at `config` instead of its strictest rung.
    pub fn starting_at(mut self, config: SurfaceConfig) -> Self {
        self.start = config;
        self
    }

    /// The best tier allowed, counting both the configured maximum and the ceiling.
    pub fn effective_ceiling(&self) -> Tier {
        self.max_tier.max(self.ceiling)
    }

    /// Probes tiers until one works for a surface of `size`. Providers claimed
    /// by the winning strategy are taken out of `providers`; the others are
    /// left in place for later re-negotiation.
    pub fn negotiate(
        &self,
        device: &mut dyn GraphicsDevice,
        providers: &mut Providers,
        size: SurfaceSize,
    ) -> Negotiated {
        let mut attempts = Vec::new();
        let walked = with_current_context(device, |device| {
            Ok::<_, DeviceError>(self.walk(device, providers, size, &mut attempts))
        });

        let (capability, surface_config, strategy) = match walked {
            Ok(winner) => winner,
            Err(e) => {
                log::warn!("Surface[{}]: negotiation without a current context: {}", self.surface_id, e);
                self.record(
                    &mut attempts,
                    Tier::CpuMediated,
                    Some(SurfaceConfig::RENDERABLE_ONLY),
                    None,
                    AttemptOutcome::Selected,
                );
                self.cpu(SurfaceConfig::RENDERABLE_ONLY)
            }
        };

        log::info!(
            "Surface[{}]: using {} with {} after {} attempts",
            self.surface_id,
            capability,
            surface_config,
            attempts.len()
        );
        Negotiated {
            capability,
            surface_config,
            strategy,
            attempts,
        }
    }

    fn walk(
        &self,
        device: &mut dyn GraphicsDevice,
        providers: &mut Providers,
        size: SurfaceSize,
        attempts: &mut Vec<NegotiationAttempt>,
    ) -> Winner {
        let ceiling = self.effective_ceiling();
        for tier in Tier::ALL.into_iter().filter(|t| *t >= ceiling) {
            let winner = match tier {
                Tier::NativeSharedMemory => self.try_native(device, providers, size, attempts),
                Tier::CrossApiInterop => self.try_interop(device, providers, size, attempts),
                Tier::CpuMediated => Some(self.try_cpu(device, size, attempts)),
            };
            if let Some(winner) = winner {
                return winner;
            }
        }
        // The CPU tier is always walked, so this is only reached with an empty tier list.
        self.try_cpu(device, size, attempts)
    }

    fn record(
        &self,
        attempts: &mut Vec<NegotiationAttempt>,
        tier: Tier,
        config: Option<SurfaceConfig>,
        attachment: Option<InteropAttachment>,
        outcome: AttemptOutcome,
    ) {
        let attempt = NegotiationAttempt {
            tier,
            config,
            attachment,
            outcome,
        };
        match attempt.outcome {
            AttemptOutcome::Selected => log::debug!("Surface[{}]: {}", self.surface_id, attempt),
            _ => log::info!("Surface[{}]: {}", self.surface_id, attempt),
        }
        attempts.push(attempt);
    }

    /// First rung whose render target builds and is complete.
    fn first_renderable(
        &self,
        device: &mut dyn GraphicsDevice,
        tier: Tier,
        size: SurfaceSize,
        attempts: &mut Vec<NegotiationAttempt>,
    ) -> Option<SurfaceConfig> {
        for &config in self.start.ladder_from() {
            match probe_render_target(device, size, config) {
                Ok(()) => return Some(config),
                Err(e) => self.record(attempts, tier, Some(config), None, AttemptOutcome::Failed(e.to_string())),
            }
        }
        None
    }

    fn try_native(
        &self,
        device: &mut dyn GraphicsDevice,
        providers: &mut Providers,
        size: SurfaceSize,
        attempts: &mut Vec<NegotiationAttempt>,
    ) -> Option<Winner> {
        let tier = Tier::NativeSharedMemory;
        let Some(provider) = providers.native.take() else {
            self.record(attempts, tier, None, None, AttemptOutcome::Unavailable("no native surface provider".into()));
            return None;
        };
        if !provider.is_available(device) {
            let why = format!("{} not supported by {}", provider.name(), device.name());
            self.record(attempts, tier, None, None, AttemptOutcome::Unavailable(why));
            providers.native = Some(provider);
            return None;
        }
        let Some(config) = self.first_renderable(device, tier, size, attempts) else {
            providers.native = Some(provider);
            return None;
        };

        let mut target = NativeTarget::new(provider);
        match target.allocate(device, size, self.host_order, 0) {
            Ok(_) => {
                target.release(device);
                self.record(attempts, tier, Some(config), None, AttemptOutcome::Selected);
                let bridge = FrameTransportBridge::new(Box::new(target), self.host_order, self.host_origin, self.slot.clone());
                Some((TransportCapability::NativeSharedMemory, config, Box::new(bridge)))
            }
            Err(e) => {
                self.record(attempts, tier, Some(config), None, AttemptOutcome::Failed(e.to_string()));
                providers.native = Some(target.into_provider());
                None
            }
        }
    }

    fn try_interop(
        &self,
        device: &mut dyn GraphicsDevice,
        providers: &mut Providers,
        size: SurfaceSize,
        attempts: &mut Vec<NegotiationAttempt>,
    ) -> Option<Winner> {
        let tier = Tier::CrossApiInterop;
        let Some(provider) = providers.interop.take() else {
            self.record(attempts, tier, None, None, AttemptOutcome::Unavailable("no interop provider".into()));
            return None;
        };
        if !provider.is_available(device) {
            let why = format!("{} extension not exposed by {}", provider.name(), device.name());
            self.record(attempts, tier, None, None, AttemptOutcome::Unavailable(why));
            providers.interop = Some(provider);
            return None;
        }

        let producer = device.adapter_info();
        let host = provider.adapter_info();
        if !producer.matches(&host) {
            let outcome = AttemptOutcome::AdapterMismatch {
                producer: producer.to_string(),
                host: host.to_string(),
            };
            self.record(attempts, tier, None, None, outcome);
            providers.interop = Some(provider);
            return None;
        }

        let mut target = InteropTarget::new(provider, InteropAttachment::Texture, self.sync_mode, self.sync_timeout);
        for &config in self.start.ladder_from() {
            if let Err(e) = probe_render_target(device, size, config) {
                self.record(attempts, tier, Some(config), None, AttemptOutcome::Failed(e.to_string()));
                continue;
            }

            for attachment in InteropAttachment::ORDER {
                target = target.with_attachment(attachment);
                match target.allocate(device, size, self.host_order, 0) {
                    Ok(_) => {
                        target.release(device);
                        self.record(attempts, tier, Some(config), Some(attachment), AttemptOutcome::Selected);
                        let bridge =
                            FrameTransportBridge::new(Box::new(target), self.host_order, self.host_origin, self.slot.clone());
                        return Some((TransportCapability::CrossApiInterop(attachment), config, Box::new(bridge)));
                    }
                    Err(e) => self.record(
                        attempts,
                        tier,
                        Some(config),
                        Some(attachment),
                        AttemptOutcome::Failed(e.to_string()),
                    ),
                }
            }
        }

        target.shutdown(device);
        providers.interop = Some(target.into_provider());
        None
    }

    fn try_cpu(&self, device: &mut dyn GraphicsDevice, size: SurfaceSize, attempts: &mut Vec<NegotiationAttempt>) -> Winner {
        let tier = Tier::CpuMediated;
        let config = self
            .first_renderable(device, tier, size, attempts)
            .unwrap_or(SurfaceConfig::RENDERABLE_ONLY);
        self.record(attempts, tier, Some(config), None, AttemptOutcome::Selected);
        self.cpu(config)
    }

    fn cpu(&self, config: SurfaceConfig) -> Winner {
        let path = FallbackCopyPath::new(self.host_order, self.host_origin);
        (TransportCapability::CpuMediated, config, Box::new(path))
    }
}
