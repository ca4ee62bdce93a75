#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole argument is free text (usually a prompt).
pub(crate) const TEXT_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "enhance",
        action: "enhance",
    },
    CommandSpec {
        command: "generate",
        action: "generate",
    },
    CommandSpec {
        command: "stylize",
        action: "stylize",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "upload",
        action: "upload",
    },
    CommandSpec {
        command: "capture",
        action: "capture",
    },
    CommandSpec {
        command: "fetch",
        action: "fetch",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "retry",
        action: "retry",
    },
    CommandSpec {
        command: "remove",
        action: "remove",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub(crate) const HISTORY_COMMAND: CommandSpec = CommandSpec {
    command: "history",
    action: "history",
};

pub(crate) const OPEN_COMMAND: CommandSpec = CommandSpec {
    command: "open",
    action: "open",
};

pub(crate) const OPTIONS_COMMAND: CommandSpec = CommandSpec {
    command: "options",
    action: "set_options",
};

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/upload <path|url>",
    "/enhance [prompt]",
    "/generate [prompt]",
    "/retry",
    "/capture [frame-path]",
    "/stylize <prompt>",
    "/options key=value ...",
    "/history [n]",
    "/open <index|task_id>",
    "/remove",
    "/status",
    "/fetch [dir]",
    "/help",
    "/quit",
];
