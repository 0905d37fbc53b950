//! Repository layer: entity-scoped database operations.

mod admin_audit;
mod analysis;
mod dataset;
mod events;
mod runs;

pub use admin_audit::*;
pub use analysis::*;
pub use dataset::*;
pub use events::*;
pub use runs::*;

/// LIKE pattern for a literal prefix match; pair with `ESCAPE '\'`.
pub fn like_prefix(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 1);
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}
