//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Stage indicators
pub static BOX: Emoji<'_, '_> = Emoji("📦 ", "[SANDBOX]");
pub static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[ANALYZE]");
pub static THINK: Emoji<'_, '_> = Emoji("🧠 ", "[GEN]");
pub static FILE_MOD: Emoji<'_, '_> = Emoji("📝 ", "~");
pub static TEST: Emoji<'_, '_> = Emoji("🧪 ", "[TEST]");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "[PUSH]");
pub static BRANCH: Emoji<'_, '_> = Emoji("🌿 ", "");
