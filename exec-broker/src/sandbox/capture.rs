use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::normalize::Captured;

const CHUNK: usize = 8 * 1024;

/// Read `reader` to EOF, keeping at most `limit` bytes. Anything past the
/// limit is drained and dropped so the child never blocks on a full pipe.
/// When `stop` fires first, what was read so far comes back flagged as
/// truncated.
pub(crate) async fn read_bounded<R>(
    mut reader: R,
    limit: usize,
    stop: CancellationToken,
) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut chunk = vec![0u8; CHUNK];
    loop {
        let n = tokio::select! {
            read = reader.read(&mut chunk) => read?,
            _ = stop.cancelled() => {
                captured.truncated = true;
                break;
            }
        };
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(captured)
}
