// Trace Filtering
// Strips runtime and scheduling frames from forwarded stack traces

/// Symbol prefixes that never reach the user
const HIDDEN_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "tokio_util::",
    "rust_begin_unwind",
    "__rust",
    "__libc",
    "_start",
    "batch_service::execution::",
];

/// Reduce a captured backtrace to the frames worth showing.
///
/// Understands the `std::backtrace::Backtrace` layout (`N: symbol` followed by
/// an optional `at file:line` line). Any other non-empty line is treated as a
/// frame on its own.
pub fn filter_frames(trace: &str) -> Vec<String> {
    let mut frames: Vec<(String, Option<String>)> = Vec::new();

    for line in trace.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(location) = line.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                if last.1.is_none() {
                    last.1 = Some(location.to_string());
                }
            }
            continue;
        }

        let symbol = match line.split_once(": ") {
            Some((index, symbol)) if index.chars().all(|c| c.is_ascii_digit()) => symbol,
            _ => line,
        };
        frames.push((symbol.to_string(), None));
    }

    frames
        .into_iter()
        .filter(|(symbol, _)| !is_hidden(symbol))
        .map(|(symbol, location)| match location {
            Some(location) => format!("{} ({})", symbol, location),
            None => symbol,
        })
        .collect()
}

fn is_hidden(symbol: &str) -> bool {
    // Generic impls render as "<T as core::ops::FnOnce>::call_once"
    let symbol = symbol.trim_start_matches('<');
    HIDDEN_PREFIXES.iter().any(|prefix| {
        symbol.starts_with(prefix) || symbol.contains(&format!(" as {}", prefix))
    })
}
