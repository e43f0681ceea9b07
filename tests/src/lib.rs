//! Cross-module scenarios for the chat transport, run against in-process fakes.

#[cfg(test)]
mod unit;
