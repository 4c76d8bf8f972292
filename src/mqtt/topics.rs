//! Topic bindings and identifier discovery
//!
//! Venus topics embed the installation (portal) ID and, for devices, a
//! three character instance ID. Either may be configured as `+`, in
//! which case it is learned from the first matching topic seen on the
//! bus. Resolution is first-writer-wins: once an identifier or a binding
//! is fixed it never changes for the lifetime of the resolver.
//!
//! ```text
//! N/{installation}/vebus/{vebus}/Mode  --observe("N/c0619ab1cafe/vebus/276/Mode")-->
//!     installation = c0619ab1cafe, vebus = 276
//!     every other binding whose slots are now known resolves as well
//! ```

use super::config::DISCOVER;
use crate::telemetry::{Channel, ChannelKey};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Identifier {
    Installation,
    Vebus,
}

impl Identifier {
    fn placeholder(&self) -> &'static str {
        match self {
            Identifier::Installation => "{installation}",
            Identifier::Vebus => "{vebus}",
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Identifier::Installation => write!(f, "installation ID"),
            Identifier::Vebus => write!(f, "vebus instance ID"),
        }
    }
}

/// Identifier values known so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identifiers {
    installation: Option<String>,
    vebus: Option<String>,
}

impl Identifiers {
    /// Builds the set from configured values; `+` or empty means unknown.
    pub fn from_config(installation: &str, vebus: &str) -> Self {
        let known = |value: &str| {
            let value = value.trim();
            (!value.is_empty() && value != DISCOVER).then(|| value.to_string())
        };
        let ids = Self {
            installation: known(installation),
            vebus: known(vebus),
        };
        if let Some(vebus) = &ids.vebus {
            if vebus.len() != 3 {
                warn!("Configured vebus ID {:?} is not three characters long", vebus);
            }
        }
        ids
    }

    pub fn get(&self, id: Identifier) -> Option<&str> {
        match id {
            Identifier::Installation => self.installation.as_deref(),
            Identifier::Vebus => self.vebus.as_deref(),
        }
    }

    /// Sets `id` unless it is already known. Returns true when it was set.
    fn fix(&mut self, id: Identifier, value: &str) -> bool {
        let slot = match id {
            Identifier::Installation => &mut self.installation,
            Identifier::Vebus => &mut self.vebus,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(value.to_string());
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Identifier),
}

/// A topic path with placeholder segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(template: &str) -> Self {
        let segments = template
            .split('/')
            .map(|segment| {
                [Identifier::Installation, Identifier::Vebus]
                    .into_iter()
                    .find(|id| id.placeholder() == segment)
                    .map(Segment::Slot)
                    .unwrap_or_else(|| Segment::Literal(segment.to_string()))
            })
            .collect();
        Self { segments }
    }

    /// Concrete topic, if every slot is known.
    pub fn render(&self, ids: &Identifiers) -> Option<String> {
        let parts: Option<Vec<&str>> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => Some(text.as_str()),
                Segment::Slot(id) => ids.get(*id),
            })
            .collect();
        parts.map(|parts| parts.join("/"))
    }

    /// Subscription filter with `+` in every unknown slot.
    pub fn filter(&self, ids: &Identifiers) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Slot(id) => ids.get(*id).unwrap_or(DISCOVER),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Positional match of a concrete topic. Known slots behave as
    /// literals; unknown slots match any non-empty segment and are
    /// returned as captures.
    fn capture(&self, topic: &str, ids: &Identifiers) -> Option<Vec<(Identifier, String)>> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut captures: Vec<(Identifier, String)> = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(text) if text == part => {}
                Segment::Literal(_) => return None,
                Segment::Slot(id) => match ids.get(*id) {
                    Some(known) if known == part => {}
                    Some(_) => return None,
                    None if part.is_empty() => return None,
                    None => match captures.iter().find(|(captured, _)| captured == id) {
                        Some((_, value)) if value != part => return None,
                        Some(_) => {}
                        None => captures.push((*id, part.to_string())),
                    },
                },
            }
        }
        Some(captures)
    }
}

/// Per-channel topic, pending or fixed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicBinding {
    Unresolved(TopicPattern),
    Resolved(String),
}

/// Emitted while resolving, so the session can adjust subscriptions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolutionEvent {
    Identifier {
        id: Identifier,
        value: String,
    },
    Binding {
        channel: ChannelKey,
        topic: String,
        /// Wildcard filter previously subscribed for this binding.
        retired_filter: Option<String>,
    },
}

#[derive(Clone, Debug)]
struct BindingEntry {
    channel: ChannelKey,
    discovery: bool,
    pattern: TopicPattern,
    binding: TopicBinding,
    /// Filter handed out by `subscriptions`, while unresolved.
    wildcard_filter: Option<String>,
}

#[derive(Debug)]
pub struct TopicResolver {
    configured: Identifiers,
    ids: Identifiers,
    entries: Vec<BindingEntry>,
    by_topic: HashMap<String, ChannelKey>,
    events: Vec<ResolutionEvent>,
}

impl TopicResolver {
    /// Creates bindings for the enabled channels. Bindings whose
    /// identifiers are configured concretely are resolved immediately.
    pub fn new(channels: &[Channel], ids: Identifiers) -> Self {
        let entries = channels
            .iter()
            .filter(|channel| channel.enabled)
            .map(|channel| {
                let pattern = TopicPattern::parse(channel.template);
                BindingEntry {
                    channel: channel.key,
                    discovery: channel.discovery,
                    binding: TopicBinding::Unresolved(pattern.clone()),
                    pattern,
                    wildcard_filter: None,
                }
            })
            .collect();

        let mut resolver = Self {
            configured: ids.clone(),
            ids,
            entries,
            by_topic: HashMap::new(),
            events: Vec::new(),
        };
        resolver.resolve_known();
        resolver.events.clear();
        resolver
    }

    /// Matches an incoming topic to its channel, resolving placeholder
    /// bindings on first sight.
    pub fn observe(&mut self, topic: &str) -> Option<ChannelKey> {
        if let Some(key) = self.by_topic.get(topic) {
            return Some(*key);
        }

        let (index, captures) = self.entries.iter().enumerate().find_map(|(i, entry)| {
            match entry.binding {
                TopicBinding::Unresolved(_) => entry
                    .pattern
                    .capture(topic, &self.ids)
                    .map(|captures| (i, captures)),
                TopicBinding::Resolved(_) => None,
            }
        })?;

        for (id, value) in captures {
            if self.ids.fix(id, &value) {
                info!("Discovered {}: {}", id, value);
                self.events.push(ResolutionEvent::Identifier { id, value });
            }
        }

        let channel = self.entries[index].channel;
        self.bind(index, topic.to_string());
        self.resolve_known();
        Some(channel)
    }

    /// Filters owed to the broker right now: concrete topics for resolved
    /// bindings and wildcard filters for unresolved discovery bindings.
    pub fn subscriptions(&mut self) -> Vec<String> {
        let ids = &self.ids;
        let mut filters = Vec::new();
        for entry in self.entries.iter_mut() {
            match &entry.binding {
                TopicBinding::Resolved(topic) => filters.push(topic.clone()),
                TopicBinding::Unresolved(pattern) if entry.discovery => {
                    let filter = pattern.filter(ids);
                    entry.wildcard_filter = Some(filter.clone());
                    filters.push(filter);
                }
                TopicBinding::Unresolved(_) => {}
            }
        }
        filters.sort();
        filters.dedup();
        filters
    }

    pub fn take_events(&mut self) -> Vec<ResolutionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn identifier(&self, id: Identifier) -> Option<&str> {
        self.ids.get(id)
    }

    pub fn identifiers(&self) -> &Identifiers {
        &self.ids
    }

    pub fn binding(&self, key: ChannelKey) -> Option<&TopicBinding> {
        self.entries
            .iter()
            .find(|entry| entry.channel == key)
            .map(|entry| &entry.binding)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = ChannelKey> + '_ {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.binding, TopicBinding::Unresolved(_)))
            .map(|entry| entry.channel)
    }

    /// Forgets everything learned from traffic.
    pub fn reset(&mut self) {
        info!("Resetting topic bindings");
        self.ids = self.configured.clone();
        self.by_topic.clear();
        self.events.clear();
        for entry in self.entries.iter_mut() {
            entry.binding = TopicBinding::Unresolved(entry.pattern.clone());
            entry.wildcard_filter = None;
        }
        self.resolve_known();
        self.events.clear();
    }

    fn resolve_known(&mut self) {
        let ready: Vec<(usize, String)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| matches!(entry.binding, TopicBinding::Unresolved(_)))
            .filter_map(|(i, entry)| entry.pattern.render(&self.ids).map(|topic| (i, topic)))
            .collect();
        for (index, topic) in ready {
            self.bind(index, topic);
        }
    }

    fn bind(&mut self, index: usize, topic: String) {
        let entry = &mut self.entries[index];
        debug!("Bound {} to {}", entry.channel, topic);
        entry.binding = TopicBinding::Resolved(topic.clone());
        self.by_topic.insert(topic.clone(), entry.channel);
        self.events.push(ResolutionEvent::Binding {
            channel: entry.channel,
            topic,
            retired_filter: entry.wildcard_filter.take(),
        });
    }
}
