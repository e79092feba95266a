//! 分片合并：按索引顺序把暂存分片拼接成单一的惰性字节流。

use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::chunks::{ChunkError, ChunkStore, Scratch};
use crate::remote::ByteStream;

/// 合并结果：顺序拼接的流，以及已知的总长度。
pub struct Assembly {
    pub chunk_count: usize,
    pub total_bytes: u64,
    stream: ByteStream,
}

impl Assembly {
    pub fn into_stream(self) -> ByteStream {
        self.stream
    }
}

/// 读取暂存区中的全部分片并生成顺序拼接的流。
///
/// 流只在被消费时打开分片文件；暂存区的删除由调用方持有的 `scratch` 负责。
pub async fn assemble(store: &ChunkStore, scratch: &Scratch) -> Result<Assembly, ChunkError> {
    let upload_id = scratch.upload_id().clone();
    let chunks = store.list_chunks(&upload_id).await?;

    let mut total_bytes = 0;
    for (_, path) in &chunks {
        total_bytes += fs::metadata(path).await?.len();
    }
    let chunk_count = chunks.len();
    debug!(
        upload_id = upload_id.as_str(),
        chunk_count, total_bytes, "assembling chunks"
    );

    let stream = stream::iter(chunks)
        .then(|(index, path)| async move {
            File::open(&path).await.map_err(|err| {
                warn!(index, error = %err, "failed to open chunk");
                err
            })
        })
        .flat_map(|opened| match opened {
            Ok(file) => ReaderStream::new(file).left_stream(),
            Err(err) => stream::once(future::ready(Err::<Bytes, _>(err))).right_stream(),
        });

    Ok(Assembly {
        chunk_count,
        total_bytes,
        stream: Box::pin(stream),
    })
}
