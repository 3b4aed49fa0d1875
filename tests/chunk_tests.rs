use command_scheduler::CommandChunk;
use command_scheduler::command::{COMMAND_HEADER_SIZE, command_footprint};

#[test]
fn test_small_chunk_rejects_and_returns_command() {
    let mut chunk: CommandChunk<Vec<u64>, 128> = CommandChunk::new();
    assert_eq!(chunk.capacity(), 128);

    let mut accepted = 0u64;
    loop {
        let id = accepted;
        match chunk.record(move |log: &mut Vec<u64>| log.push(id)) {
            Ok(()) => accepted += 1,
            Err(rejected) => {
                // The rejected command is intact and can run elsewhere.
                let mut side = Vec::new();
                rejected(&mut side);
                assert_eq!(side, vec![accepted]);
                break;
            }
        }
    }

    let footprint = command_footprint::<Vec<u64>, [u64; 1]>();
    assert!(footprint > COMMAND_HEADER_SIZE);
    assert_eq!(accepted as usize, 128 / footprint);
    assert_eq!(chunk.len(), accepted as usize);

    let mut log = Vec::new();
    chunk.execute_all(&mut log);
    assert_eq!(log, (0..accepted).collect::<Vec<_>>());
    assert!(chunk.is_empty());
}

#[test]
fn test_chunk_reused_after_execution() {
    let mut chunk: CommandChunk<Vec<u64>> = CommandChunk::default();
    let mut log = Vec::new();

    for round in 0..3u64 {
        for i in 0..4 {
            chunk
                .record(move |log: &mut Vec<u64>| log.push(round * 10 + i))
                .ok()
                .unwrap();
        }
        chunk.execute_all(&mut log);
        assert_eq!(chunk.used_bytes(), 0);
        assert_eq!(chunk.remaining(), chunk.capacity());
    }

    assert_eq!(log, vec![0, 1, 2, 3, 10, 11, 12, 13, 20, 21, 22, 23]);
}
