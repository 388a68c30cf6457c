use std::sync::Arc;
use std::time::Duration;

use orionix_ai_harness::prelude::*;
use orionix_ai_harness::vendors::scripted::{ScriptStep, ScriptedProvider};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), HarnessError> {
    let flaky = ScriptedProvider::new("flaky").with_script(vec![
        ScriptStep::Delta("half a pa".into()),
        ScriptStep::FailTransient("upstream overloaded".into()),
    ]);
    let steady = ScriptedProvider::new("steady").with_script(vec![
        ScriptStep::Delta("Hello ".into()),
        ScriptStep::Delay(Duration::from_millis(50)),
        ScriptStep::Delta("from the fallback".into()),
        ScriptStep::Complete,
    ]);
    let harness = Harness::builder()
        .register_provider(ProviderSpec::new("flaky", "scripted").priority(1), Arc::new(flaky))
        .register_provider(ProviderSpec::new("steady", "scripted").priority(2), Arc::new(steady))
        .build()?;

    let mut run = harness.run().user_text("Stream a greeting.").start_stream().await?;
    while let Some(event) = run.next_event().await {
        match event {
            FailoverEvent::AttemptStarted { attempt, provider, .. } => {
                println!("[attempt {attempt} on {provider}]")
            }
            FailoverEvent::Chunk { chunk, .. } => print!("{}", chunk.text),
            FailoverEvent::AttemptAbandoned { reason, .. } => println!("\n[abandoned: {reason}]"),
            FailoverEvent::Succeeded { .. } => println!(),
            FailoverEvent::Failed { failure, .. } => eprintln!("run error: {failure}"),
        }
    }

    let output = run.finish().await?;
    println!("response of record: {:?}", output.text());
    Ok(())
}
