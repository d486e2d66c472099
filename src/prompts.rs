//! Prompt templates for the three LLM phases (extraction, aggregation,
//! evaluation), §4.3/§4.4. Grounded in tone and structure on
//! `prompts/extraction.py`, `prompts/aggregation.py`, `prompts/evaluation.py`
//! — all Lithuanian, matching the documents the Gateway analyzes.

use std::collections::HashMap;

/// Sentinel that should never appear in a real template.
const ESCAPE_SENTINEL: &str = "\x00LBRACE\x00";
const ESCAPE_SENTINEL_CLOSE: &str = "\x00RBRACE\x00";

/// Substitute `{key}` placeholders in `template` with values from `vars`.
/// `{{`/`}}` escape to literal braces.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut rendered = template.replace("{{", ESCAPE_SENTINEL);
    rendered = rendered.replace("}}", ESCAPE_SENTINEL_CLOSE);

    for (key, value) in vars {
        let placeholder = format!("{{{key}}}");
        rendered = rendered.replace(&placeholder, value);
    }

    rendered = rendered.replace(ESCAPE_SENTINEL, "{");
    rendered.replace(ESCAPE_SENTINEL_CLOSE, "}")
}

/// 1-indexed numbered list, one item per line.
pub fn numbered_list(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// System prompt for the per-document extraction phase.
pub fn extraction_system() -> &'static str {
    "Tu esi patyręs viešųjų pirkimų dokumentų analitikas Lietuvoje. \
Tavo užduotis — kruopščiai išanalizuoti pateiktą dokumentą ir ištraukti visą struktūrizuotą informaciją.\n\n\
Taisyklės:\n\
- Jei informacijos nėra šiame dokumente, grąžink null tam laukui\n\
- Citatuok tikslias reikšmes: sumas, datas, terminus, procentus\n\
- Sumas rašyk skaičiais (ne žodžiais), valiutą nurodyk atskirai\n\
- Datas formatuok ISO 8601 (YYYY-MM-DD)\n\
- Jei matai neaiškumą ar galimą prieštaravimą, aprašyk confidence_notes lauke\n\
- confidence_notes VISADA turi būti masyvas, pvz: [\"pastaba1\"] arba []\n\
- Visą tekstą rašyk lietuvių kalba\n\
- Neišgalvok informacijos — tik tai, kas yra dokumente\n\
- Atsakyk TIK JSON formatu — be markdown, be papildomo teksto"
}

/// User prompt for the per-document extraction phase.
pub fn extraction_user(filename: &str, document_type: &str, page_count: u32, content: &str) -> String {
    let mut vars = HashMap::new();
    vars.insert("filename", filename.to_string());
    vars.insert("document_type", document_type.to_string());
    vars.insert("page_count", page_count.to_string());
    vars.insert("content", content.to_string());

    render(
        "Analizuojamas dokumentas:\n\
- Failo pavadinimas: {filename}\n\
- Dokumento tipas: {document_type}\n\
- Puslapių skaičius: {page_count}\n\n\
Dokumento turinys:\n\
---\n\
{content}\n\
---\n\n\
Ištrauk informaciją pagal nurodytą JSON schemą.",
        &vars,
    )
}

/// System prompt for the cross-document aggregation phase.
pub fn aggregation_system() -> &'static str {
    "Tu esi viešųjų pirkimų ekspertas. Tau pateikti extraction rezultatai \
iš kelių pirkimo dokumentų. Tavo užduotis — sujungti juos į vieną pilną, nuoseklią ataskaitą.\n\n\
Taisyklės:\n\
- Jei informacija kartojasi keliuose dokumentuose — deduplikuok, palik tiksliausią versiją\n\
- Jei informacija prieštarauja — pažymėk confidence_notes su abiem versijomis ir nurodyk šaltinius\n\
- Prioritetizavimas (nuo aukščiausio): techninė specifikacija > pirkimo sąlygos > kvietimas > priedai\n\
- requirements turi būti išsamus sąrašas iš VISŲ dokumentų (ne tik vieno)\n\
- source_documents turi apimti VISUS analizuotus dokumentus\n\
- summary turi apibūdinti visą pirkimą, ne vieną dokumentą\n\
- Nerašyk \"pagal dokumentą X...\" — rašyk tiesiogiai faktus"
}

/// User prompt for the aggregation phase, given already-formatted
/// per-document result blocks (numbered, fenced JSON).
pub fn aggregation_user(doc_count: usize, per_doc_results: &str) -> String {
    let mut vars = HashMap::new();
    vars.insert("doc_count", doc_count.to_string());
    vars.insert("per_doc_results", per_doc_results.to_string());

    render(
        "Iš viso analizuoti {doc_count} dokumentai.\n\n\
{per_doc_results}\n\n\
Sujunk į vieną galutinę ataskaitą pagal nurodytą JSON schemą.",
        &vars,
    )
}

/// System prompt for the final quality-evaluation phase.
pub fn evaluation_system() -> &'static str {
    "Tu esi viešųjų pirkimų ataskaitų kokybės auditorius. \
Tavo užduotis — įvertinti galutinės ataskaitos pilnumą ir nuoseklumą.\n\n\
Vertink pagal šiuos kriterijus:\n\
1. Ar užpildyti visi svarbūs laukai? (summary, organization, estimated_value, submission_deadline, requirements, qualifications, evaluation_criteria)\n\
2. Ar nėra prieštaravimų tarp laukų?\n\
3. Ar sumos ir datos atrodo logiškos?\n\
4. Ar qualifications pakankamai detalūs?\n\
5. Ar evaluation_criteria svoriai sudaro 100%?\n\n\
completeness_score: 1.0 = viskas puikiai užpildyta, 0.0 = nieko nėra.\n\
Būk griežtas — 0.8+ reiškia labai gerą ataskaitą."
}

/// User prompt for the evaluation phase.
pub fn evaluation_user(report_json: &str, document_list: &str) -> String {
    let mut vars = HashMap::new();
    vars.insert("report_json", report_json.to_string());
    vars.insert("document_list", document_list.to_string());

    render(
        "Galutinė ataskaita:\n\
{report_json}\n\n\
Analizuotų dokumentų sąrašas:\n\
{document_list}\n\n\
Įvertink ataskaitos kokybę pagal nurodytą JSON schemą.",
        &vars,
    )
}

/// Format one document's extraction as a numbered, fenced JSON block
/// (§4.4 aggregation prompt assembly), grounded on
/// `aggregation.py::aggregate_results`'s `per_doc_blocks`.
pub fn format_extraction_block(index: usize, filename: &str, extraction_json: &str) -> String {
    format!("Dokumentas {index}: {filename}\n```json\n{extraction_json}\n```")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_keys() {
        let mut vars = HashMap::new();
        vars.insert("name", "Alice".to_string());
        let result = render("Hello {name}", &vars);
        assert_eq!(result, "Hello Alice");
    }

    #[test]
    fn render_escapes_double_braces() {
        let vars = HashMap::new();
        let result = render("JSON: {{\"key\": \"val\"}}", &vars);
        assert_eq!(result, r#"JSON: {"key": "val"}"#);
    }

    #[test]
    fn numbered_list_is_one_indexed() {
        let items = vec!["first".to_string(), "second".to_string()];
        assert_eq!(numbered_list(&items), "1. first\n2. second");
    }

    #[test]
    fn extraction_user_interpolates_all_fields() {
        let prompt = extraction_user("tender.pdf", "contract", 5, "full text here");
        assert!(prompt.contains("tender.pdf"));
        assert!(prompt.contains("contract"));
        assert!(prompt.contains('5'));
        assert!(prompt.contains("full text here"));
    }

    #[test]
    fn aggregation_user_includes_doc_count_and_blocks() {
        let prompt = aggregation_user(3, "Dokumentas 1: a.pdf\n```json\n{}\n```");
        assert!(prompt.contains("3 dokumentai"));
        assert!(prompt.contains("a.pdf"));
    }

    #[test]
    fn format_extraction_block_matches_expected_shape() {
        let block = format_extraction_block(1, "tender.pdf", "{\"title\":null}");
        assert_eq!(block, "Dokumentas 1: tender.pdf\n```json\n{\"title\":null}\n```");
    }

    #[test]
    fn system_prompts_are_lithuanian_and_nonempty() {
        assert!(extraction_system().contains("lietuvių"));
        assert!(aggregation_system().contains("ataskaitą"));
        assert!(evaluation_system().contains("completeness_score"));
    }
}
