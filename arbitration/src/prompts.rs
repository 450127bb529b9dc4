//! Prompt text for the model-facing roles
//!
//! Kept deliberately small: the pipeline only depends on the reply
//! contracts parsed in [`crate::reply`].

use crate::types::Problem;

pub fn solver_system(domain: &str) -> String {
    format!(
        "You are an expert in {domain}. Solve the task rigorously and critically.\n\
         State your assumptions, the risks and limitations, the supporting evidence, \
         and the self-checks you performed.\n\
         Reply with JSON only:\n\
         {{\"final_answer\": \"...\", \"confidence\": 0.0-1.0, \"assumptions\": [], \
         \"risks\": [], \"evidence\": [], \"self_checks\": []}}"
    )
}

pub fn solver_user(problem: &Problem) -> String {
    format!(
        "Task ID: {}\n\nProblem:\n{}\n\nSolve the problem following the system instructions.",
        problem.id, problem.text
    )
}

pub fn rebuttal_system(domain: &str) -> String {
    format!(
        "You are an expert in {domain} taking part in a review round. \
         Find the weaknesses in the other answers, then improve your own answer. \
         Keep your answer if it is already correct.\n\
         Reply with JSON only:\n\
         {{\"critique\": \"...\", \"final_answer\": \"...\", \"confidence\": 0.0-1.0}}"
    )
}

pub fn rebuttal_user(problem: &Problem, own_answer: &str, peers: &[(&str, &str)]) -> String {
    let mut prompt = format!(
        "Task ID: {}\n\nProblem:\n{}\n\n## Other answers\n\n",
        problem.id, problem.text
    );
    for (i, (model_id, answer)) in peers.iter().enumerate() {
        prompt.push_str(&format!("### Answer {} ({})\n{}\n\n", i + 1, model_id, answer));
    }
    prompt.push_str("## Your previous answer\n\n");
    prompt.push_str(own_answer);
    prompt.push_str("\n\nCritique the other answers and revise yours.");
    prompt
}

pub fn arbiter_system(domain: &str) -> String {
    format!(
        "You are an arbiter for {domain} answers. Do not solve the task yourself.\n\
         Judge the answer on internal consistency, fit to the problem conditions, \
         unjustified assumptions, awareness of risks, quality of argument and \
         appropriate caution.\n\
         Reply with JSON only: {{\"score\": 0.0-1.0}}"
    )
}

pub fn arbiter_user(problem: &str, answer: &str) -> String {
    format!("Problem:\n{problem}\n\nCandidate answer:\n{answer}\n\nScore the answer.")
}

pub fn synthesis_system(domain: &str, k: usize) -> String {
    format!(
        "You merge the top {k} answers to a {domain} problem into one final answer. \
         Keep the correct parts, resolve contradictions explicitly and give more \
         weight to higher-weighted answers.\n\
         Reply with JSON only: {{\"final_answer\": \"...\"}}"
    )
}

pub fn synthesis_user(problem: &Problem, weighted: &[(&str, f64, &str)]) -> String {
    let mut prompt = format!(
        "Task ID: {}\n\nProblem:\n{}\n\n## Candidates\n\n",
        problem.id, problem.text
    );
    for (model_id, weight, answer) in weighted {
        prompt.push_str(&format!("### {model_id} (weight {weight:.3})\n{answer}\n\n"));
    }
    prompt.push_str("Synthesize the final answer.");
    prompt
}
