pub mod feed_client; // 上流フィードの境界
pub mod innertube; // YouTube InnerTube アダプター
pub mod youtube; // 視聴ページのスクレイピング
