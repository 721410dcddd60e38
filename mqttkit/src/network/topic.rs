//! 主题与订阅过滤器

/// filter 是否含有通配符
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// 发布使用的 topic 不能为空，也不能包含通配符
pub fn valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !has_wildcards(topic)
}

pub fn valid_subscribe_filter(filter: &str) -> bool {
    // 不可以订阅空 filter
    if filter.is_empty() {
        return false;
    }

    let levels = filter.split('/').collect::<Vec<&str>>();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        // # 只能单独占据最后一层
        if level.contains('#') && (i != last || *level != "#") {
            return false;
        }
        // + 必须单独占据一层
        if level.contains('+') && *level != "+" {
            return false;
        }
    }

    true
}

/// 订阅的 filter 是否匹配发布消息使用的 topic
///
/// 以 `$` 开头的 topic 不会被以通配符开头的 filter 匹配
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filters = filter.split('/').peekable();
    if topic.starts_with('$') && matches!(filters.peek(), Some(&"+") | Some(&"#")) {
        return false;
    }

    let mut topics = topic.split('/');
    for f in filters {
        // # 匹配父级及所有子级
        if f == "#" {
            return true;
        }

        match topics.next() {
            // + 直接匹配这一层
            Some(_) if f == "+" => continue,
            // 没有通配符，必须完全匹配
            Some(t) if f != t => return false,
            Some(_) => continue,
            // topic 层级不够了
            None => return false,
        }
    }

    // filter 层级不够了
    topics.next().is_none()
}
