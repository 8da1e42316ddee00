//! Inbound text -> [`Intent`].
//!
//! Text starting with `/` is a command, everything else is a post. Parsing is
//! pure and total: anything that doesn't fit the grammar becomes
//! [`Intent::Unknown`].

use crate::{domain::UserId, messaging::types::Envelope};

pub const COMMAND_PREFIX: char = '/';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    Post(String),
    Follow(UserId),
    Unfollow(UserId),
    Invite(UserId),
    /// Accept the invite sent by this user.
    AcceptInvite(UserId),
    DeclineInvite(UserId),
    Block(UserId),
    Unblock(UserId),
    /// Drop this user from the sender's followers.
    RemoveFollower(UserId),
    ListFollowers,
    ListFollowing,
    SetName(String),
    OptOut,
    OptIn,
    Echo(String),
    Help(Option<String>),
    AdminBroadcast(String),
    /// Make this user follow the sender without an invite.
    AdminForceInvite(UserId),
    AdminInspect(UserId),
    AdminShutdown,
    /// Unrecognized verb, or a known verb with a missing/malformed argument.
    Unknown { verb: String },
}

/// One user-visible command.
#[derive(Clone, Copy, Debug)]
pub struct CommandInfo {
    pub verb: &'static str,
    pub usage: &'static str,
    pub admin: bool,
}

pub const COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        verb: "follow",
        usage: "/follow [number]. follow someone",
        admin: false,
    },
    CommandInfo {
        verb: "unfollow",
        usage: "/unfollow [number]. unfollow someone",
        admin: false,
    },
    CommandInfo {
        verb: "invite",
        usage: "/invite [number]. invite someone to follow you",
        admin: false,
    },
    CommandInfo {
        verb: "accept",
        usage: "/accept [number]. accept an invite from that number",
        admin: false,
    },
    CommandInfo {
        verb: "decline",
        usage: "/decline [number]. turn down an invite from that number",
        admin: false,
    },
    CommandInfo {
        verb: "block",
        usage: "/block [number]. stop receiving posts from someone",
        admin: false,
    },
    CommandInfo {
        verb: "unblock",
        usage: "/unblock [number]. receive posts from someone again",
        admin: false,
    },
    CommandInfo {
        verb: "softblock",
        usage: "/softblock [number]. remove someone from your followers",
        admin: false,
    },
    CommandInfo {
        verb: "followers",
        usage: "/followers. list your followers",
        admin: false,
    },
    CommandInfo {
        verb: "following",
        usage: "/following. list who you follow",
        admin: false,
    },
    CommandInfo {
        verb: "name",
        usage: "/name [name]. set or change your name",
        admin: false,
    },
    CommandInfo {
        verb: "stop",
        usage: "/stop. stop receiving all messages",
        admin: false,
    },
    CommandInfo {
        verb: "start",
        usage: "/start. resume receiving messages",
        admin: false,
    },
    CommandInfo {
        verb: "echo",
        usage: "/echo [text]. repeats what you say",
        admin: false,
    },
    CommandInfo {
        verb: "help",
        usage: "/help [command]. see the documentation for command, or all commands",
        admin: false,
    },
    CommandInfo {
        verb: "broadcast",
        usage: "/broadcast [text]. send a message to every user",
        admin: true,
    },
    CommandInfo {
        verb: "forceinvite",
        usage: "/forceinvite [number]. make someone follow you",
        admin: true,
    },
    CommandInfo {
        verb: "inspect",
        usage: "/inspect [number]. show a user's relationships",
        admin: true,
    },
    CommandInfo {
        verb: "shutdown",
        usage: "/shutdown. stop the bot",
        admin: true,
    },
];

pub fn command_info(verb: &str) -> Option<&'static CommandInfo> {
    let verb = verb.trim_start_matches(COMMAND_PREFIX).to_lowercase();
    COMMANDS.iter().find(|c| c.verb == verb)
}

/// Static help text listing every non-admin command.
pub fn help_text() -> String {
    let verbs = COMMANDS
        .iter()
        .filter(|c| !c.admin)
        .map(|c| c.verb)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "documented commands: {verbs}. anything that doesn't start with / is sent to your followers"
    )
}

/// Usage for one verb, or `None` if the verb doesn't exist.
pub fn help_for(verb: &str) -> Option<&'static str> {
    command_info(verb).map(|c| c.usage)
}

/// Split `/verb rest of line` into a lowercased verb and the trimmed argument.
fn split_command(text: &str) -> (String, String) {
    let body = text.trim().trim_start_matches(COMMAND_PREFIX);
    let mut parts = body.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("").trim().to_lowercase();
    let rest = parts.next().unwrap_or("").trim().to_string();
    (verb, rest)
}

/// Interpret one envelope.
pub fn interpret(envelope: &Envelope) -> Intent {
    parse_text(&envelope.text)
}

pub fn parse_text(text: &str) -> Intent {
    if !text.trim_start().starts_with(COMMAND_PREFIX) {
        return Intent::Post(text.trim().to_string());
    }

    let (verb, arg) = split_command(text);
    let unknown = || Intent::Unknown { verb: verb.clone() };
    let target = || UserId::parse_target(&arg);
    let text_arg = || (!arg.is_empty()).then(|| arg.clone());

    let intent = match verb.as_str() {
        "follow" => target().map(Intent::Follow),
        "unfollow" => target().map(Intent::Unfollow),
        "invite" => target().map(Intent::Invite),
        "accept" => target().map(Intent::AcceptInvite),
        "decline" => target().map(Intent::DeclineInvite),
        "block" => target().map(Intent::Block),
        "unblock" => target().map(Intent::Unblock),
        "softblock" => target().map(Intent::RemoveFollower),
        "followers" => Some(Intent::ListFollowers),
        "following" => Some(Intent::ListFollowing),
        "name" => text_arg().map(Intent::SetName),
        "stop" => Some(Intent::OptOut),
        "start" => Some(Intent::OptIn),
        "echo" => text_arg().map(Intent::Echo),
        "help" => Some(Intent::Help(
            arg.split_whitespace().next().map(|s| s.to_lowercase()),
        )),
        "broadcast" => text_arg().map(Intent::AdminBroadcast),
        "forceinvite" => target().map(Intent::AdminForceInvite),
        "inspect" => target().map(Intent::AdminInspect),
        "shutdown" => Some(Intent::AdminShutdown),
        _ => None,
    };

    intent.unwrap_or_else(unknown)
}

impl Intent {
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Intent::AdminBroadcast(_)
                | Intent::AdminForceInvite(_)
                | Intent::AdminInspect(_)
                | Intent::AdminShutdown
        )
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::Post(_) => "post",
            Intent::Follow(_) => "follow",
            Intent::Unfollow(_) => "unfollow",
            Intent::Invite(_) => "invite",
            Intent::AcceptInvite(_) => "accept",
            Intent::DeclineInvite(_) => "decline",
            Intent::Block(_) => "block",
            Intent::Unblock(_) => "unblock",
            Intent::RemoveFollower(_) => "softblock",
            Intent::ListFollowers => "followers",
            Intent::ListFollowing => "following",
            Intent::SetName(_) => "name",
            Intent::OptOut => "stop",
            Intent::OptIn => "start",
            Intent::Echo(_) => "echo",
            Intent::Help(_) => "help",
            Intent::AdminBroadcast(_) => "broadcast",
            Intent::AdminForceInvite(_) => "forceinvite",
            Intent::AdminInspect(_) => "inspect",
            Intent::AdminShutdown => "shutdown",
            Intent::Unknown { .. } => "unknown",
        }
    }
}
