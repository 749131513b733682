use std::fmt;

/// Which side of a device a subscription taps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// One (device, channel, direction) subscription.
///
/// String form: `deviceType|deviceName:channelIndex:in|out`. The legacy
/// form without a device type (`deviceName:channelIndex:in|out`) still
/// parses, with an empty type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSubscription {
    pub device_type: String,
    pub device_name: String,
    pub channel: usize,
    pub direction: Direction,
}

impl ChannelSubscription {
    pub fn new(
        device_type: impl Into<String>,
        device_name: impl Into<String>,
        channel: usize,
        direction: Direction,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            device_name: device_name.into(),
            channel,
            direction,
        }
    }

    /// Composite key avoiding name collisions across device backends.
    pub fn device_key(&self) -> String {
        device_key(&self.device_type, &self.device_name)
    }

    /// Parses the serialized form; `None` on any malformed field.
    pub fn parse(text: &str) -> Option<Self> {
        let (device_type, rest) = match text.split_once('|') {
            Some((device_type, rest)) => (device_type, rest),
            None => ("", text),
        };

        // Device names may contain ':'; the channel and direction are the
        // last two segments.
        let mut tail = rest.rsplitn(3, ':');
        let direction = match tail.next()? {
            "in" => Direction::Input,
            "out" => Direction::Output,
            _ => return None,
        };
        let channel: usize = tail.next()?.parse().ok()?;
        let device_name = tail.next()?;
        if device_name.is_empty() {
            return None;
        }

        Some(Self {
            device_type: device_type.to_string(),
            device_name: device_name.to_string(),
            channel,
            direction,
        })
    }
}

impl fmt::Display for ChannelSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Input => "in",
            Direction::Output => "out",
        };
        write!(
            f,
            "{}|{}:{}:{}",
            self.device_type, self.device_name, self.channel, direction
        )
    }
}

pub fn device_key(device_type: &str, device_name: &str) -> String {
    format!("{device_type}|{device_name}")
}

/// A client's full subscription set. Ordering is semantic: the n-th input
/// subscription becomes channel n of the client's pulled buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    pub inputs: Vec<ChannelSubscription>,
    pub outputs: Vec<ChannelSubscription>,
}

impl ClientState {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub fn serialize(&self) -> String {
        let mut parts = Vec::with_capacity(2 + self.inputs.len() + self.outputs.len());
        parts.push(format!("IN:{}", self.inputs.len()));
        for sub in &self.inputs {
            parts.push(sub.to_string());
        }
        parts.push(format!("OUT:{}", self.outputs.len()));
        for sub in &self.outputs {
            parts.push(sub.to_string());
        }
        parts.join(";")
    }

    /// Parses the serialized form. Unparseable subscriptions are skipped;
    /// unrecognised segments are ignored.
    pub fn deserialize(data: &str) -> Self {
        let mut state = ClientState::default();
        let parts: Vec<&str> = data.split(';').collect();
        let mut index = 0;
        while index < parts.len() {
            let segment = parts[index];
            if let Some(count) = segment.strip_prefix("IN:").and_then(|n| n.parse::<usize>().ok()) {
                index += 1;
                for _ in 0..count {
                    if index >= parts.len() {
                        break;
                    }
                    if let Some(sub) = ChannelSubscription::parse(parts[index]) {
                        state.inputs.push(sub);
                    }
                    index += 1;
                }
            } else if let Some(count) = segment.strip_prefix("OUT:").and_then(|n| n.parse::<usize>().ok()) {
                index += 1;
                for _ in 0..count {
                    if index >= parts.len() {
                        break;
                    }
                    if let Some(sub) = ChannelSubscription::parse(parts[index]) {
                        state.outputs.push(sub);
                    }
                    index += 1;
                }
            } else {
                index += 1;
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_round_trips() {
        let sub = ChannelSubscription::new("WASAPI", "Speakers", 3, Direction::Output);
        let parsed = ChannelSubscription::parse(&sub.to_string()).unwrap();
        assert_eq!(parsed, sub);
    }

    #[test]
    fn legacy_form_parses_with_empty_type() {
        let sub = ChannelSubscription::parse("Microphone:0:in").unwrap();
        assert_eq!(sub.device_type, "");
        assert_eq!(sub.device_name, "Microphone");
        assert_eq!(sub.channel, 0);
        assert_eq!(sub.direction, Direction::Input);
    }

    #[test]
    fn device_name_may_contain_colons() {
        let sub = ChannelSubscription::parse("ALSA|hw:0,0:2:in").unwrap();
        assert_eq!(sub.device_name, "hw:0,0");
        assert_eq!(sub.channel, 2);
    }

    #[test]
    fn malformed_subscriptions_yield_none() {
        assert!(ChannelSubscription::parse("").is_none());
        assert!(ChannelSubscription::parse("Speakers").is_none());
        assert!(ChannelSubscription::parse("Speakers:x:in").is_none());
        assert!(ChannelSubscription::parse("Speakers:1:sideways").is_none());
    }

    #[test]
    fn client_state_round_trips() {
        let state = ClientState {
            inputs: vec![
                ChannelSubscription::new("ASIO", "Interface", 0, Direction::Input),
                ChannelSubscription::new("ASIO", "Interface", 1, Direction::Input),
            ],
            outputs: vec![ChannelSubscription::new(
                "WASAPI",
                "Speakers",
                0,
                Direction::Output,
            )],
        };
        assert_eq!(ClientState::deserialize(&state.serialize()), state);
    }

    #[test]
    fn deserialize_skips_garbage_segments() {
        let state = ClientState::deserialize("junk;IN:1;ASIO|Mic:0:in;stray;OUT:0");
        assert_eq!(state.inputs.len(), 1);
        assert!(state.outputs.is_empty());

        let empty = ClientState::deserialize("");
        assert!(empty.is_empty());
    }
}
