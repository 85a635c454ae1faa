/*!
# Relaychat Command Line Interface

## Example Usage

```bash
relaychat --address=<identity> --relay=ws://relay.example:4444
```

Settings can also come from a `config` file (yaml/toml/json) in the working
directory; flags win over file values.
*/

use relaychat::client;

#[tokio::main]
pub async fn main() -> relaychat::Result<()> {
    tracing_subscriber::fmt::init();
    client::run().await
}
