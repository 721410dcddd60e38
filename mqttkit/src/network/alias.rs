//! 主题别名
//!
//! 每个连接的每个方向各有一张表，别名在连接断开后失效

use std::collections::HashMap;

use super::packet::Publish;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Topic alias {0} out of range")]
    OutOfRange(u16),
    #[error("Unknown topic alias {0}")]
    Unknown(u16),
    #[error("Empty topic without topic alias")]
    EmptyTopic,
}

/// 出站消息使用别名的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    /// 别名已注册，只发送别名
    Reuse(u16),
    /// 新分配的别名，同时发送 topic 与别名
    Assign(u16),
    /// 别名已用完或对端不接受别名
    Unaliased,
}

#[derive(Debug, Default)]
pub struct TopicAliasTable {
    /// 可用的最大别名，0 表示不使用别名
    maximum: u16,
    topics: HashMap<String, u16>,
    aliases: HashMap<u16, String>,
}

impl TopicAliasTable {
    pub fn new(maximum: u16) -> Self {
        Self {
            maximum,
            ..Default::default()
        }
    }

    pub fn maximum(&self) -> u16 {
        self.maximum
    }

    /// 清空所有别名并设置新的上限，连接重建时调用
    pub fn reset(&mut self, maximum: u16) {
        self.maximum = maximum;
        self.topics.clear();
        self.aliases.clear();
    }

    /// 出站方向：查找或分配 topic 的别名，并改写消息
    ///
    /// 分配最小的空闲别名，用完后不再替换
    pub fn compress(&mut self, publish: &mut Publish) -> Outbound {
        if let Some(alias) = self.topics.get(&publish.topic) {
            publish.topic.clear();
            publish.properties.topic_alias = Some(*alias);
            return Outbound::Reuse(*alias);
        }

        let next = match (1..=self.maximum).find(|alias| !self.aliases.contains_key(alias)) {
            Some(next) => next,
            None => return Outbound::Unaliased,
        };

        self.topics.insert(publish.topic.clone(), next);
        self.aliases.insert(next, publish.topic.clone());
        publish.properties.topic_alias = Some(next);
        Outbound::Assign(next)
    }

    /// 撤销一次 [`Outbound::Assign`]，消息没能发出时调用
    pub fn release(&mut self, alias: u16) {
        if let Some(topic) = self.aliases.remove(&alias) {
            self.topics.remove(&topic);
        }
    }

    /// 入站方向：登记或解析消息中的别名，并还原 topic
    pub fn resolve(&mut self, publish: &mut Publish) -> Result<(), Error> {
        let alias = match publish.properties.topic_alias.take() {
            Some(alias) => alias,
            None if publish.topic.is_empty() => return Err(Error::EmptyTopic),
            None => return Ok(()),
        };
        if alias == 0 || alias > self.maximum {
            return Err(Error::OutOfRange(alias));
        }

        if publish.topic.is_empty() {
            match self.aliases.get(&alias) {
                Some(topic) => publish.topic = topic.clone(),
                None => return Err(Error::Unknown(alias)),
            }
        } else {
            // 对端可以把已用的别名重新指向新的 topic
            if let Some(old) = self.aliases.insert(alias, publish.topic.clone()) {
                self.topics.remove(&old);
            }
            self.topics.insert(publish.topic.clone(), alias);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(topic: &str) -> Publish {
        Publish::new(topic, &b"x"[..])
    }

    #[test]
    fn compress_assigns_then_reuses() {
        let mut table = TopicAliasTable::new(2);

        let mut p = publish("a");
        assert_eq!(table.compress(&mut p), Outbound::Assign(1));
        assert_eq!(p.topic, "a");
        assert_eq!(p.properties.topic_alias, Some(1));

        let mut p = publish("a");
        assert_eq!(table.compress(&mut p), Outbound::Reuse(1));
        assert_eq!(p.topic, "");
        assert_eq!(p.properties.topic_alias, Some(1));

        assert_eq!(table.compress(&mut publish("b")), Outbound::Assign(2));

        // 别名用完
        let mut p = publish("c");
        assert_eq!(table.compress(&mut p), Outbound::Unaliased);
        assert_eq!(p.topic, "c");
        assert_eq!(p.properties.topic_alias, None);
    }

    #[test]
    fn compress_disabled() {
        let mut table = TopicAliasTable::new(0);
        assert_eq!(table.compress(&mut publish("a")), Outbound::Unaliased);
        assert_eq!(table.compress(&mut publish("a")), Outbound::Unaliased);
    }

    #[test]
    fn release_frees_alias() {
        let mut table = TopicAliasTable::new(1);
        assert_eq!(table.compress(&mut publish("a")), Outbound::Assign(1));
        table.release(1);
        assert_eq!(table.compress(&mut publish("b")), Outbound::Assign(1));
    }

    #[test]
    fn reset_forgets_aliases() {
        let mut table = TopicAliasTable::new(1);
        table.compress(&mut publish("a"));
        table.reset(3);
        assert_eq!(table.maximum(), 3);
        assert_eq!(table.compress(&mut publish("b")), Outbound::Assign(1));
    }

    #[test]
    fn resolve_registers_and_expands() {
        let mut table = TopicAliasTable::new(5);

        let mut p = publish("/test/mqttools/foo");
        p.properties.topic_alias = Some(1);
        table.resolve(&mut p).unwrap();
        assert_eq!(p.topic, "/test/mqttools/foo");
        assert_eq!(p.properties.topic_alias, None);

        let mut p = publish("");
        p.properties.topic_alias = Some(1);
        table.resolve(&mut p).unwrap();
        assert_eq!(p.topic, "/test/mqttools/foo");

        // 重新指向
        let mut p = publish("other");
        p.properties.topic_alias = Some(1);
        table.resolve(&mut p).unwrap();
        let mut p = publish("");
        p.properties.topic_alias = Some(1);
        table.resolve(&mut p).unwrap();
        assert_eq!(p.topic, "other");
    }

    #[test]
    fn resolve_errors() {
        let mut table = TopicAliasTable::new(5);

        let mut p = publish("");
        p.properties.topic_alias = Some(2);
        assert_eq!(table.resolve(&mut p), Err(Error::Unknown(2)));

        let mut p = publish("a");
        p.properties.topic_alias = Some(6);
        assert_eq!(table.resolve(&mut p), Err(Error::OutOfRange(6)));

        let mut p = publish("a");
        p.properties.topic_alias = Some(0);
        assert_eq!(table.resolve(&mut p), Err(Error::OutOfRange(0)));

        assert_eq!(table.resolve(&mut publish("")), Err(Error::EmptyTopic));
        assert_eq!(table.resolve(&mut publish("a")), Ok(()));
    }
}
