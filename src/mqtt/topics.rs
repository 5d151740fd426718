/// Topic names derived from the configured prefix.
///
/// ```text
/// {prefix}/status               status snapshots, retained
/// {prefix}/status/offline       last will
/// {prefix}/control              control surface (observed only)
/// {prefix}/command              outbound commands
/// {prefix}/response/{id}        per-command responses
/// {prefix}/#                    wildcard subscription
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    prefix: String,
    status: String,
    offline: String,
    control: String,
    command: String,
    response_root: String,
    wildcard: String,
}

/// What an inbound topic refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind<'a> {
    Status,
    Response { command_id: &'a str },
    Control,
    Command,
    Other,
    Foreign,
}

impl TopicLayout {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/').to_string();
        Self {
            status: format!("{prefix}/status"),
            offline: format!("{prefix}/status/offline"),
            control: format!("{prefix}/control"),
            command: format!("{prefix}/command"),
            response_root: format!("{prefix}/response/"),
            wildcard: format!("{prefix}/#"),
            prefix,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn offline(&self) -> &str {
        &self.offline
    }

    pub fn control(&self) -> &str {
        &self.control
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn wildcard(&self) -> &str {
        &self.wildcard
    }

    pub fn response(&self, command_id: &str) -> String {
        format!("{}{}", self.response_root, command_id)
    }

    pub fn classify<'a>(&self, topic: &'a str) -> TopicKind<'a> {
        if topic == self.status
            || topic
                .strip_prefix(self.status.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
        {
            return TopicKind::Status;
        }
        if let Some(id) = topic.strip_prefix(self.response_root.as_str()) {
            if !id.is_empty() && !id.contains('/') {
                return TopicKind::Response { command_id: id };
            }
            return TopicKind::Other;
        }
        if topic == self.control {
            return TopicKind::Control;
        }
        if topic == self.command {
            return TopicKind::Command;
        }
        match topic.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.starts_with('/') => TopicKind::Other,
            _ => TopicKind::Foreign,
        }
    }
}
