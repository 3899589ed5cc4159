//! Minimal IRCv3 line handling for Twitch chat.

/// One parsed IRC line, borrowing from the raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine<'a> {
    pub tags: Option<&'a str>,
    pub prefix: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
    /// Text after the ` :` separator.
    pub trailing: Option<&'a str>,
}

impl<'a> IrcLine<'a> {
    /// Parse a single line without its `\r\n`. Returns `None` for blank input.
    #[must_use]
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let tags = match rest.strip_prefix('@') {
            Some(tagged) => {
                let (tags, after) = tagged.split_once(' ')?;
                rest = after;
                Some(tags)
            },
            None => None,
        };
        rest = rest.trim_start();
        let prefix = match rest.strip_prefix(':') {
            Some(prefixed) => {
                let (prefix, after) = prefixed.split_once(' ')?;
                rest = after;
                Some(prefix)
            },
            None => None,
        };

        let (head, trailing) = match rest.find(" :") {
            Some(i) => (&rest[..i], Some(&rest[i + 2..])),
            None => (rest, None),
        };
        let mut words = head.split(' ').filter(|w| !w.is_empty());
        let command = words.next()?;
        Some(Self {
            tags,
            prefix,
            command,
            params: words.collect(),
            trailing,
        })
    }

    /// Nickname part of the prefix (`nick!user@host`).
    #[must_use]
    pub fn nick(&self) -> Option<&'a str> {
        self.prefix
            .map(|p| p.split_once('!').map_or(p, |(nick, _)| nick))
    }

    /// Value of tag `key`, unescaped only for the common `\s` case.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags?
            .split(';')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.replace("\\s", " "))
    }
}

#[must_use]
pub fn pass(access_token: &str) -> String {
    let token = access_token.strip_prefix("oauth:").unwrap_or(access_token);
    format!("PASS oauth:{token}")
}

#[must_use]
pub fn nick(login: &str) -> String {
    format!("NICK {}", login.to_ascii_lowercase())
}

#[must_use]
pub fn join(channel: &str) -> String {
    format!("JOIN #{}", channel.to_ascii_lowercase())
}

#[must_use]
pub fn part(channel: &str) -> String {
    format!("PART #{}", channel.to_ascii_lowercase())
}

/// `PRIVMSG` for one chat line. Line breaks would start a new IRC command,
/// so they are flattened to spaces.
#[must_use]
pub fn privmsg(channel: &str, text: &str) -> String {
    let text: String = text
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    format!("PRIVMSG #{} :{text}", channel.to_ascii_lowercase())
}

#[must_use]
pub fn pong(line: &IrcLine<'_>) -> String {
    match line.trailing {
        Some(server) => format!("PONG :{server}"),
        None => "PONG".to_string(),
    }
}

/// Whether a `NOTICE` reports a failed login.
#[must_use]
pub fn is_login_failure(line: &IrcLine<'_>) -> bool {
    line.command == "NOTICE"
        && line.trailing.is_some_and(|t| {
            t.contains("Login authentication failed") || t.contains("Improperly formatted auth")
        })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn parses_tagged_privmsg() {
        let raw = "@badge-info=;color=#FF0000;display-name=Viewer\\sOne :viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #streamer :2\r\n";
        let line = IrcLine::parse(raw).unwrap();
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#streamer"]);
        assert_eq!(line.trailing, Some("2"));
        assert_eq!(line.nick(), Some("viewer"));
        assert_eq!(line.tag("display-name").as_deref(), Some("Viewer One"));
        assert_eq!(line.tag("missing"), None);
    }

    #[test]
    fn trailing_keeps_inner_colons() {
        let line = IrcLine::parse(":a!a@a PRIVMSG #c :time is 12:30 :)").unwrap();
        assert_eq!(line.trailing, Some("time is 12:30 :)"));
    }

    #[rstest]
    #[case("PING :tmi.twitch.tv", "PING", None)]
    #[case(":tmi.twitch.tv 001 bot :Welcome, GLHF!", "001", Some("tmi.twitch.tv"))]
    #[case(":tmi.twitch.tv RECONNECT", "RECONNECT", Some("tmi.twitch.tv"))]
    fn parses_server_lines(
        #[case] raw: &str,
        #[case] command: &str,
        #[case] prefix: Option<&str>,
    ) {
        let line = IrcLine::parse(raw).unwrap();
        assert_eq!(line.command, command);
        assert_eq!(line.prefix, prefix);
    }

    #[test]
    fn blank_line_is_ignored() {
        assert!(IrcLine::parse("").is_none());
        assert!(IrcLine::parse("\r\n").is_none());
    }

    #[test]
    fn pong_echoes_server() {
        let ping = IrcLine::parse("PING :tmi.twitch.tv").unwrap();
        assert_eq!(pong(&ping), "PONG :tmi.twitch.tv");
    }

    #[test]
    fn outbound_commands() {
        assert_eq!(pass("abc"), "PASS oauth:abc");
        assert_eq!(pass("oauth:abc"), "PASS oauth:abc");
        assert_eq!(nick("MyBot"), "NICK mybot");
        assert_eq!(join("Streamer"), "JOIN #streamer");
        assert_eq!(privmsg("streamer", "a\nb"), "PRIVMSG #streamer :a b");
    }

    #[test]
    fn detects_login_failure() {
        let notice = IrcLine::parse(":tmi.twitch.tv NOTICE * :Login authentication failed").unwrap();
        assert!(is_login_failure(&notice));
        let other = IrcLine::parse(":tmi.twitch.tv NOTICE #c :Slow mode is on").unwrap();
        assert!(!is_login_failure(&other));
    }
}
