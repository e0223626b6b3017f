// Topic subscription index: topic -> identities, with the reverse map kept in
// lockstep so purging one identity touches only its own topics.

use std::collections::{HashMap, HashSet};

use super::{Identity, Topic};

#[derive(Debug, Default)]
pub(crate) struct TopicIndex {
    by_topic: HashMap<Topic, HashSet<Identity>>,
    by_identity: HashMap<Identity, HashSet<Topic>>,
}

impl TopicIndex {
    /// Returns true when the membership is new.
    pub(crate) fn subscribe(&mut self, identity: &str, topic: &str) -> bool {
        let added =
            self.by_topic.entry(topic.to_owned()).or_default().insert(identity.to_owned());
        self.by_identity.entry(identity.to_owned()).or_default().insert(topic.to_owned());
        added
    }

    /// Returns true when the identity was a member. Empty entries on either
    /// side are removed.
    pub(crate) fn unsubscribe(&mut self, identity: &str, topic: &str) -> bool {
        let removed = match self.by_topic.get_mut(topic) {
            Some(members) => {
                let removed = members.remove(identity);
                if members.is_empty() {
                    self.by_topic.remove(topic);
                }
                removed
            }
            None => false,
        };

        if let Some(topics) = self.by_identity.get_mut(identity) {
            topics.remove(topic);
            if topics.is_empty() {
                self.by_identity.remove(identity);
            }
        }

        removed
    }

    /// Drop every subscription held by `identity`. Returns the topics it left.
    pub(crate) fn purge(&mut self, identity: &str) -> Vec<Topic> {
        let Some(topics) = self.by_identity.remove(identity) else {
            return Vec::new();
        };

        for topic in &topics {
            if let Some(members) = self.by_topic.get_mut(topic) {
                members.remove(identity);
                if members.is_empty() {
                    self.by_topic.remove(topic);
                }
            }
        }

        topics.into_iter().collect()
    }

    pub(crate) fn members(&self, topic: &str) -> HashSet<Identity> {
        self.by_topic.get(topic).cloned().unwrap_or_default()
    }

    pub(crate) fn members_iter<'a>(&'a self, topic: &str) -> impl Iterator<Item = &'a Identity> {
        self.by_topic.get(topic).into_iter().flatten()
    }

    pub(crate) fn topics_for(&self, identity: &str) -> Vec<Topic> {
        let mut topics = self
            .by_identity
            .get(identity)
            .map(|topics| topics.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.by_topic.len()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward = self.by_topic.iter().all(|(topic, members)| {
            !members.is_empty()
                && members.iter().all(|identity| {
                    self.by_identity.get(identity).is_some_and(|topics| topics.contains(topic))
                })
        });
        let reverse = self.by_identity.iter().all(|(identity, topics)| {
            !topics.is_empty()
                && topics.iter().all(|topic| {
                    self.by_topic.get(topic).is_some_and(|members| members.contains(identity))
                })
        });
        forward && reverse
    }
}
