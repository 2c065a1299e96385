#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Keeps helper tools (7-Zip, the torrent agent) from flashing a console window.
#[inline]
pub fn hide_console_window(command: &mut tokio::process::Command) {
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    {
        let _ = command;
    }
}

/// Keeps the tail of long tool output, where the actual error usually is.
pub fn trim_text_snippet(value: &str, limit: usize) -> String {
    let trimmed = value.trim();
    let count = trimmed.chars().count();
    if count <= limit {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - limit).collect();
    format!("...{}", tail.trim_start())
}
