/// Filler lines shown while a generation job is in flight. Purely
/// perceived-latency mitigation; nothing reads them back.
pub const FUN_FACTS: &[&str] = &[
    "Did you know? The word 'dream' comes from the Middle English word 'dreme,' which means joy and music.",
    "'Imagination is the only weapon in the war against reality.' – Lewis Carroll",
    "'The future belongs to those who believe in the beauty of their dreams.' – Eleanor Roosevelt",
    "Dreams can sometimes predict the future—it's called precognitive dreaming.",
    "'All men who have achieved great things have been great dreamers.' – Orison Swett Marden",
    "'Dreams are today's answers to tomorrow's questions.' – Edgar Cayce",
    "'You are never too old to set another goal or to dream a new dream.' – C.S. Lewis",
    "'Hold fast to dreams, for if dreams die, life is a broken-winged bird that cannot fly.' – Langston Hughes",
    "Lucid dreaming is the practice of becoming aware of and controlling your dreams.",
    "'A dream you dream alone is only a dream. A dream you dream together is reality.' – John Lennon",
];

/// How many progress ticks a fact stays on screen before rotating.
pub const FACT_ROTATION_TICKS: u64 = 5;

/// Deterministic rotation keyed on the progress tick, so the cadence is
/// decoupled from the poll interval and reproducible in tests.
pub fn fact_for_tick(tick: u64) -> &'static str {
    let slot = (tick / FACT_ROTATION_TICKS) as usize;
    FUN_FACTS[slot % FUN_FACTS.len()]
}

/// True on the ticks where the displayed fact changes.
pub fn fact_rotates_at(tick: u64) -> bool {
    tick % FACT_ROTATION_TICKS == 0
}
