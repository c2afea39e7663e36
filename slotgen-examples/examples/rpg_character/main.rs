use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use slotgen::config::EngineConfig;
use slotgen::interpreter::{Inputs, Interpreter};
use slotgen::program::{Program, Turn};
use slotgen::slot::Slot;
use slotgen::utils::llm::openai::OpenAIEndpoint;
use slotgen::utils::token::tiktoken::Tiktoken;

const MODEL: &str = "gpt-3.5-turbo-instruct";

const CHARACTER: &str = r#"
    The following is a character profile for an RPG game in JSON format.
    ```json
    {
        "id": "{[id]}",
        "description": "{[description]}",
        "name": "{[name]}",
        "age": {[age]},
        "armor": "{[armor]}",
        "weapon": "{[weapon]}",
        "class": "{[class]}",
        "mantra": "{[mantra]}",
        "strength": {[strength]},
        "items": [{[items]}]
    }
    ```"#;

fn character_program() -> slotgen::Result<Program> {
    let item = Turn::builder()
        .text("\"")
        .slot_unnamed(Slot::string().max_tokens(8))
        .text("\", ")
        .try_build()?;
    let turn = Turn::from_template(None, CHARACTER, [
        ("name", Slot::string().max_tokens(10)),
        ("age", Slot::range(16, 80)?),
        ("armor", Slot::select(["leather", "chainmail", "plate"])?),
        ("weapon", Slot::select(["sword", "axe", "mace", "spear", "bow", "crossbow"])?),
        ("class", Slot::string().max_tokens(5)),
        ("mantra", Slot::string().temperature(0.7)),
        ("strength", Slot::range(1, 20)?),
        ("items", Slot::repeat(3, item)?),
    ])?;
    Program::new(vec![turn])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let tokenizer = Arc::new(Tiktoken::new(MODEL)?);
    let endpoint = Arc::new(OpenAIEndpoint::for_model(MODEL));
    let mut interpreter = Interpreter::new(endpoint, tokenizer, EngineConfig::new(MODEL))
        .with_echo(|text: &str| {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        });

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let program = character_program()?;
    let inputs = Inputs::from([
        ("id".to_string(), "e1f491f7-7ab8-4dac-8c20-c92b5e7d883d".to_string()),
        ("description".to_string(), "A quick and nimble fighter.".to_string()),
    ]);
    match interpreter.run(&program, &inputs, &cancel).await {
        Ok(evaluation) => {
            println!("\n\nGenerated values:\n{:#}", evaluation.to_json());
            for (name, error) in evaluation.errors() {
                println!("{}: {}", name.unwrap_or("<unnamed>"), error);
            }
        }
        Err(error) => match error.partial() {
            Some(partial) => println!("\n\nCancelled. Partial output of the last slot: {:?}", partial.content),
            None => return Err(error.into()),
        },
    }
    Ok(())
}
