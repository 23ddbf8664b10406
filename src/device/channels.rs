use bitflags::bitflags;

/// Most channels any Ectocontrol device packs into one register.
pub const MAX_CHANNELS: usize = 16;

bitflags! {
    /// Channel state word as the firmware lays it out.
    ///
    /// Channels 0-7 fill the high byte from the top down, channels 8-15 fill
    /// the low byte from the bottom up. The reversal in the high byte is how
    /// the devices report state and must not be "fixed".
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
    pub struct ChannelWord: u16 {
        const CH0 = 1 << 15;
        const CH1 = 1 << 14;
        const CH2 = 1 << 13;
        const CH3 = 1 << 12;
        const CH4 = 1 << 11;
        const CH5 = 1 << 10;
        const CH6 = 1 << 9;
        const CH7 = 1 << 8;
        const CH8 = 1 << 0;
        const CH9 = 1 << 1;
        const CH10 = 1 << 2;
        const CH11 = 1 << 3;
        const CH12 = 1 << 4;
        const CH13 = 1 << 5;
        const CH14 = 1 << 6;
        const CH15 = 1 << 7;
    }
}

impl ChannelWord {
    /// Flag for channel `channel`, `None` past the last packable channel.
    pub const fn for_channel(channel: usize) -> Option<Self> {
        let bit = match channel {
            0..=7 => 15 - channel,
            8..=15 => channel - 8,
            _ => return None,
        };
        Some(Self::from_bits_retain(1 << bit))
    }

    pub fn from_states(states: &[bool]) -> Self {
        states
            .iter()
            .enumerate()
            .filter(|&(_, &on)| on)
            .filter_map(|(channel, _)| Self::for_channel(channel))
            .fold(Self::empty(), |word, flag| word | flag)
    }

    /// Decode the first `count` channels.
    pub fn to_states(self, count: usize) -> Vec<bool> {
        (0..count)
            .map(|channel| Self::for_channel(channel).is_some_and(|flag| self.contains(flag)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_byte_is_reversed() {
        // intentional: channel 0 is the MSB, channel 7 is bit 8
        assert_eq!(ChannelWord::for_channel(0).unwrap().bits(), 0x8000);
        assert_eq!(ChannelWord::for_channel(7).unwrap().bits(), 0x0100);
        assert_eq!(ChannelWord::for_channel(8).unwrap().bits(), 0x0001);
        assert_eq!(ChannelWord::for_channel(9).unwrap().bits(), 0x0002);
        assert_eq!(ChannelWord::for_channel(16), None);
    }

    #[test]
    fn first_eight_channels_fill_the_high_byte() {
        let word = ChannelWord::from_states(&[true; 8]);
        assert_eq!(word.bits(), 0xFF00);
    }

    #[test]
    fn decode_matches_encode() {
        let states = vec![
            true, false, false, true, false, false, false, false, false, true,
        ];
        let word = ChannelWord::from_states(&states);
        assert_eq!(word, ChannelWord::CH0 | ChannelWord::CH3 | ChannelWord::CH9);
        assert_eq!(word.to_states(10), states);
    }

    #[test]
    fn bits_beyond_count_are_ignored() {
        let word = ChannelWord::from_bits_retain(0x8003);
        assert_eq!(word.to_states(9), vec![
            true, false, false, false, false, false, false, false, true
        ]);
    }
}
