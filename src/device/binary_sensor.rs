use super::channels::ChannelWord;
use crate::bank::RegisterSpace;
use crate::error::Result;
use crate::slave::SlaveHandle;

/// Input register with the contact states.
pub const STATE_REGISTER: u16 = 0x10;

#[derive(Debug, Clone)]
pub struct BinarySensorState {
    channels: Vec<bool>,
}

impl BinarySensorState {
    pub fn new(slave: &SlaveHandle, channel_count: usize) -> Result<Self> {
        slave.add_block(RegisterSpace::Input, STATE_REGISTER, 1)?;
        Ok(Self {
            channels: vec![false; channel_count],
        })
    }

    pub fn channels(&self) -> &[bool] {
        &self.channels
    }

    pub fn channel(&self, channel: usize) -> Option<bool> {
        self.channels.get(channel).copied()
    }

    /// Returns whether the register was written. Setting a channel to the
    /// state it already has does not touch the bank.
    pub fn set_channel(&mut self, slave: &SlaveHandle, channel: usize, on: bool) -> Result<bool> {
        match self.channels.get(channel) {
            None => {
                tracing::debug!(
                    slave = slave.address(),
                    channel,
                    "Ignoring unknown sensor channel"
                );
                Ok(false)
            }
            Some(&current) if current == on => Ok(false),
            Some(_) => {
                let mut next = self.channels.clone();
                next[channel] = on;
                self.set_word(slave, ChannelWord::from_states(&next))?;
                self.channels = next;
                Ok(true)
            }
        }
    }

    /// Publish a raw channel word and adopt it as the channel state.
    pub fn set_word(&mut self, slave: &SlaveHandle, word: ChannelWord) -> Result<()> {
        slave.set_values(RegisterSpace::Input, STATE_REGISTER, &[word.bits()])?;
        self.channels = word.to_states(self.channels.len());
        Ok(())
    }
}
