pub mod game_results_api;
