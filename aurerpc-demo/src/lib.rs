use std::time::Duration;

use aurerpc::Service;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct SumArgs {
    pub num1: i64,
    pub num2: i64,
}

/// The demo arithmetic service: `Arith.Sum` adds, `Arith.Sleep` adds after
/// sleeping `num1` seconds (handy for exercising timeouts).
#[must_use]
pub fn arith_service() -> Service {
    Service::new("Arith")
        .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) })
        .method("Sleep", |args: SumArgs| async move {
            tokio::time::sleep(Duration::from_secs(args.num1.max(0) as u64)).await;
            Ok(args.num1 + args.num2)
        })
}
