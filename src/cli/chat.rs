//! Interactive terminal chat.

use std::io::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{Agent, Profile};
use crate::config::Config;
use crate::error::{ForgeError, Result};
use crate::llm::{LlmClient, OpenAiCompatClient};
use crate::storage::{Session, SessionStatus, SqliteStore, Store};
use crate::tools::Registry;
use crate::util::generate_title;

use super::ChatArgs;

const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const GRAY: &str = "\x1b[90m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

pub async fn run(args: ChatArgs) -> Result<()> {
    let cfg = Config::load()?;
    let store = SqliteStore::open(&cfg.storage.db_path)?;

    let profile = match &args.profile {
        Some(name) => {
            let path = std::path::Path::new(&cfg.agent.profiles_dir).join(format!("{name}.yaml"));
            Some(Profile::load(&path)?)
        }
        None => None,
    };

    let provider_name = args
        .provider
        .clone()
        .or_else(|| profile.as_ref().and_then(|p| (!p.provider.is_empty()).then(|| p.provider.clone())))
        .unwrap_or_else(|| cfg.default_provider.clone());
    let provider = cfg.provider(&provider_name)?.clone();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let model = match args.model.clone() {
        Some(model) => model,
        None => match profile.as_ref().and_then(|p| (!p.model.is_empty()).then(|| p.model.clone())) {
            Some(model) => model,
            None if provider.is_ollama() => {
                let default = provider.models.get("default").cloned().unwrap_or_default();
                pick_ollama_model(&provider.base_url, &provider.api_key, &default, &mut stdin)
                    .await
                    .unwrap_or(default)
            }
            None => provider.models.get("default").cloned().unwrap_or_default(),
        },
    };

    let mut max_iter = cfg.agent.max_iterations;
    if let Some(p) = &profile {
        if p.max_iterations > 0 {
            max_iter = p.max_iterations;
        }
    }

    println!("Forge - Interactive Agent Chat");
    if let Some(p) = &profile {
        println!("Profile: {}", p.name);
    }
    println!("Provider: {provider_name} | Model: {model}");

    let mut registry = Registry::new();
    for (name, tool_cfg) in &cfg.tools {
        if let Err(e) = registry.register(name, tool_cfg).await {
            println!("Warning: failed to start tool server {name}: {e}");
        }
    }
    if registry.has_tools() {
        println!("Tools: MCP servers loaded");
    } else {
        println!("Tools: builtin shell_exec");
    }
    let registry = Arc::new(registry);

    let client = Arc::new(OpenAiCompatClient::new(
        &provider.base_url,
        &provider.api_key,
        &model,
    ));
    let mut agent = Agent::new(client, Some(registry.clone()), max_iter);
    agent.set_max_tokens(cfg.agent.context_max_tokens);

    if let Some(utility_model) = provider.models.get("utility") {
        if !utility_model.is_empty() {
            agent.set_utility_llm(Arc::new(OpenAiCompatClient::new(
                &provider.base_url,
                &provider.api_key,
                utility_model,
            )));
            println!("Utility model: {utility_model}");
        }
    }

    if let Some(p) = &profile {
        agent.set_system_prompt(&p.system_prompt);
        agent.filter_tools(&p.tools);
    }

    // Create or resume the session.
    let mut sess = match &args.resume {
        Some(resume_id) => {
            let mut sess = store.get_session(resume_id)?;
            let messages = store.load_messages(&sess.id)?;
            agent.set_history(messages);
            sess.status = SessionStatus::Active;
            store.update_session(&mut sess)?;
            println!("Session: {} (resumed)", &sess.id[..8.min(sess.id.len())]);
            sess
        }
        None => {
            let mut sess = Session::new(Uuid::new_v4().to_string());
            sess.provider = provider_name.clone();
            sess.model = model.clone();
            sess.profile = args.profile.clone().unwrap_or_default();
            store.create_session(&mut sess)?;
            println!("Session: {}", &sess.id[..8]);
            sess
        }
    };

    println!("Type /help for commands, /quit to exit\n");

    agent.set_on_text_delta(|delta| {
        print!("{delta}");
        let _ = std::io::stdout().flush();
    });
    agent.set_on_tool_call(|name, args| {
        let rendered: Vec<String> = args.iter().map(|(k, v)| format!("{k}={v}")).collect();
        println!("\n  {YELLOW}⚡ Tool: {name}({}){RESET}", rendered.join(", "));
    });
    agent.set_on_tool_result(|_name, result| {
        let lines: Vec<&str> = result.trim().lines().collect();
        for line in lines.iter().take(8) {
            println!("  {GRAY}│ {line}{RESET}");
        }
        if lines.len() > 8 {
            println!("  {GRAY}│ ... ({} more lines){RESET}", lines.len() - 8);
        }
        println!();
    });

    let mut chat = ChatState {
        cfg: &cfg,
        store: &store,
        provider_name,
        model,
        first_message: args.resume.is_none(),
    };

    loop {
        print!("{CYAN}you>{RESET} ");
        let _ = std::io::stdout().flush();

        let input = tokio::select! {
            line = stdin.next_line() => match line? {
                Some(line) => line,
                None => break, // EOF
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        let input = input.trim().to_string();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            if chat.handle_command(&input, &mut agent, &mut sess) {
                continue;
            }
            break; // /quit
        }

        if chat.first_message {
            sess.title = generate_title(&input);
            let _ = store.update_session(&mut sess);
            chat.first_message = false;
        }

        // Ctrl-C cancels only the in-flight turn; the loop keeps driving the
        // turn so it can flush partial output and unwind cleanly.
        let cancel = CancellationToken::new();
        print!("\n{GREEN}forge>{RESET} ");
        let _ = std::io::stdout().flush();

        let result = {
            let turn = agent.run_streaming(&cancel, &input);
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    result = &mut turn => break result,
                    _ = tokio::signal::ctrl_c() => cancel.cancel(),
                }
            }
        };

        // Auto-save after each turn, interrupted or not.
        if let Err(e) = store.save_messages(&sess.id, agent.history()) {
            eprintln!("warning: failed to save session: {e}");
        }

        match result {
            Ok(_) => println!("\n"),
            Err(ForgeError::Cancelled) => {
                println!("\n(interrupted)");
            }
            Err(e) => println!("\n{RED}error: {e}{RESET}\n"),
        }
    }

    println!("Goodbye!");
    if sess.status == SessionStatus::Active {
        sess.status = SessionStatus::Completed;
        let _ = store.update_session(&mut sess);
    }
    registry.close().await;
    Ok(())
}

struct ChatState<'a> {
    cfg: &'a Config,
    store: &'a SqliteStore,
    provider_name: String,
    model: String,
    first_message: bool,
}

impl ChatState<'_> {
    /// Handle a slash command. Returns false only for /quit.
    fn handle_command(&mut self, input: &str, agent: &mut Agent, sess: &mut Session) -> bool {
        let fields: Vec<&str> = input.split_whitespace().collect();
        match fields[0].to_lowercase().as_str() {
            "/quit" | "/exit" | "/q" => return false,
            "/reset" => {
                agent.reset();
                println!("Conversation reset.\n");
            }
            "/history" => {
                println!("{}\n", agent.history_json());
            }
            "/model" => {
                self.handle_model_command(&fields[1..], agent, sess);
            }
            "/help" => {
                println!("Commands:");
                println!("  /help              - Show this help");
                println!("  /model             - Show current provider and model");
                println!("  /model <model>     - Switch model (e.g. /model qwen3:8b)");
                println!("  /model <p>/<model> - Switch provider and model");
                println!("  /reset             - Clear conversation history");
                println!("  /history           - Show raw conversation history (JSON)");
                println!("  /quit              - Exit");
                println!();
            }
            _ => {
                println!("Unknown command: {input} (try /help)\n");
            }
        }
        true
    }

    fn handle_model_command(&mut self, args: &[&str], agent: &mut Agent, sess: &mut Session) {
        let Some(target) = args.first() else {
            println!("Provider: {} | Model: {}\n", self.provider_name, self.model);
            return;
        };

        let (new_provider, new_model) = match target.split_once('/') {
            Some((provider, model)) if !provider.is_empty() => {
                (provider.to_string(), model.to_string())
            }
            _ => (self.provider_name.clone(), target.to_string()),
        };

        let provider_cfg = match self.cfg.provider(&new_provider) {
            Ok(p) => p,
            Err(e) => {
                println!("Error: {e}\n");
                return;
            }
        };

        // A turn already in flight keeps its old client; only subsequent
        // turns pick up the swap.
        agent.set_client(Arc::new(OpenAiCompatClient::new(
            &provider_cfg.base_url,
            &provider_cfg.api_key,
            &new_model,
        )));
        self.provider_name = new_provider.clone();
        self.model = new_model.clone();

        sess.provider = new_provider;
        sess.model = new_model;
        let _ = self.store.update_session(sess);

        println!("Switched to {}/{}\n", self.provider_name, self.model);
    }
}

/// Query Ollama for available models and let the user pick one.
async fn pick_ollama_model(
    base_url: &str,
    api_key: &str,
    default_model: &str,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Option<String> {
    let client = OpenAiCompatClient::new(base_url, api_key, "");
    let models = client.list_models(&CancellationToken::new()).await.ok()?;
    if models.is_empty() {
        return None;
    }

    println!("Available models:");
    let mut default_idx = None;
    for (i, m) in models.iter().enumerate() {
        let size_gb = m.size as f64 / (1024.0 * 1024.0 * 1024.0);
        let marker = if m.name == default_model {
            default_idx = Some(i);
            "* "
        } else {
            "  "
        };
        println!("  {marker}{}) {:<30} ({size_gb:.1} GB)", i + 1, m.name);
    }

    let hint = default_idx
        .map(|i| format!(" [{}]", i + 1))
        .unwrap_or_default();
    print!("\nSelect model{hint}: ");
    let _ = std::io::stdout().flush();

    let choice = stdin.next_line().await.ok()??;
    let choice = choice.trim();

    if choice.is_empty() {
        return default_idx.map(|i| models[i].name.clone());
    }
    let n: usize = choice.parse().ok()?;
    if n < 1 || n > models.len() {
        return None;
    }
    Some(models[n - 1].name.clone())
}
