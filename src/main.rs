#[tokio::main]
async fn main() -> std::io::Result<()> {
    imgrab::app::run().await
}
