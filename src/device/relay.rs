use super::channels::ChannelWord;
use crate::bank::RegisterSpace;
use crate::error::Result;
use crate::slave::SlaveHandle;

/// Holding register with the channel word.
pub const STATE_REGISTER: u16 = 0x10;
/// First holding register of the per-channel timer block.
pub const TIMER_REGISTER: u16 = 0x20;

const TIMER_INITIAL_STATE: u16 = 1 << 15;
const TIMER_TIMEOUT_MASK: u16 = 0x7FFF;

/// Encode a timer word: bit 15 is the state applied on expiry, bits 14..0 the
/// timeout in 500 ms steps, truncated.
pub fn encode_timer(initial_state: bool, timeout_seconds: f64) -> u16 {
    // `as` saturates and maps NaN to 0
    let half_seconds = (timeout_seconds * 2.0) as u32;
    let timeout = half_seconds.min(u32::from(TIMER_TIMEOUT_MASK)) as u16;
    if initial_state {
        TIMER_INITIAL_STATE | timeout
    } else {
        timeout
    }
}

#[derive(Debug, Clone)]
pub struct RelayState {
    channels: Vec<bool>,
    timers: Vec<u16>,
}

impl RelayState {
    pub fn new(slave: &SlaveHandle, channel_count: usize) -> Result<Self> {
        slave.add_block(RegisterSpace::Holding, STATE_REGISTER, 1)?;
        slave.add_block(RegisterSpace::Holding, TIMER_REGISTER, channel_count as u16)?;
        Ok(Self {
            channels: vec![false; channel_count],
            timers: vec![0; channel_count],
        })
    }

    pub fn channels(&self) -> &[bool] {
        &self.channels
    }

    pub fn timers(&self) -> &[u16] {
        &self.timers
    }

    pub fn channel(&self, channel: usize) -> Option<bool> {
        self.channels.get(channel).copied()
    }

    pub fn timer(&self, channel: usize) -> Option<u16> {
        self.timers.get(channel).copied()
    }

    /// Returns whether the register was written.
    pub fn set_channel(&mut self, slave: &SlaveHandle, channel: usize, on: bool) -> Result<bool> {
        match self.channels.get(channel) {
            None => {
                tracing::debug!(slave = slave.address(), channel, "Ignoring unknown relay channel");
                return Ok(false);
            }
            Some(&current) if current == on => return Ok(false),
            Some(_) => {}
        }
        let mut next = self.channels.clone();
        next[channel] = on;
        slave.set_values(
            RegisterSpace::Holding,
            STATE_REGISTER,
            &[ChannelWord::from_states(&next).bits()],
        )?;
        self.channels = next;
        Ok(true)
    }

    pub fn set_timer(
        &mut self,
        slave: &SlaveHandle,
        channel: usize,
        initial_state: bool,
        timeout_seconds: f64,
    ) -> Result<bool> {
        if channel >= self.timers.len() {
            tracing::debug!(slave = slave.address(), channel, "Ignoring unknown timer channel");
            return Ok(false);
        }
        let value = encode_timer(initial_state, timeout_seconds);
        slave.set_values(RegisterSpace::Holding, TIMER_REGISTER + channel as u16, &[value])?;
        self.timers[channel] = value;
        Ok(true)
    }

    /// Sync from registers a master has written. Returns the channels whose
    /// state changed, in channel order.
    pub fn apply_write(&mut self, start: u16, values: &[u16]) -> Vec<(usize, bool)> {
        let mut changed = Vec::new();
        for (address, &value) in (u32::from(start)..).zip(values) {
            if address == u32::from(STATE_REGISTER) {
                let states = ChannelWord::from_bits_retain(value).to_states(self.channels.len());
                for (channel, (current, next)) in self.channels.iter_mut().zip(states).enumerate() {
                    if *current != next {
                        *current = next;
                        changed.push((channel, next));
                    }
                }
            } else if let Some(offset) = address.checked_sub(u32::from(TIMER_REGISTER)) {
                if let Some(timer) = self.timers.get_mut(offset as usize) {
                    *timer = value;
                }
            }
        }
        changed
    }
}
