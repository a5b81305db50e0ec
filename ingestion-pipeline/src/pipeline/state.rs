use state_machines::state_machine;

state_machine! {
    name: IngestMachine,
    state: IngestState,
    initial: Ready,
    states: [Ready, Extracted, Split, Processed, Ingested, Failed],
    events {
        extract { transition: { from: Ready, to: Extracted } }
        split { transition: { from: Extracted, to: Split } }
        process { transition: { from: Split, to: Processed } }
        ingest { transition: { from: Processed, to: Ingested } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Split, to: Failed }
            transition: { from: Processed, to: Failed }
            transition: { from: Ingested, to: Failed }
        }
    }
}

pub fn ready() -> IngestMachine<(), Ready> {
    IngestMachine::new(())
}
